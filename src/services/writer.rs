//! src/services/writer.rs
//!
//! Chunk Writer: the upload pipeline. An input byte stream is cut into
//! fixed-size, sequence-numbered chunks; each chunk is acknowledged by the
//! chunk store before the next one is accepted, and the metadata record only
//! becomes `complete` once every chunk is durable.

use crate::{
    models::{
        chunk::{Chunk, chunk_count, is_valid_chunk_size},
        object::{ObjectId, ObjectRecord, ObjectStatus},
    },
    services::{
        chunk_store::{ChunkStore, PurgeReport},
        metadata_index::MetadataIndex,
        storage_service::{StorageError, StorageResult},
    },
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, pin_mut};
use parking_lot::Mutex;
use std::{collections::HashMap, io, sync::Arc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Acknowledgement for one durably written chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub seq: u64,
    pub len: u64,
    /// Bytes accepted so far in this session, this chunk included.
    pub total_len: u64,
}

/// What an abort managed to clean up. Never an error: leftovers are
/// reconciled by the sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbortReport {
    pub purge: PurgeReport,
    pub metadata_removed: bool,
    /// Whether cleanup finished without leaving residue.
    pub complete: bool,
}

/// Writer-side state of one in-progress upload.
struct SessionState {
    chunk_size: u64,
    next_seq: u64,
    length: u64,
    /// Set once a chunk shorter than `chunk_size` arrives; only the last chunk may be short.
    saw_short_chunk: bool,
    digest: md5::Context,
    closed: bool,
}

impl SessionState {
    fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            next_seq: 0,
            length: 0,
            saw_short_chunk: false,
            digest: md5::Context::new(),
            closed: false,
        }
    }
}

type SessionSlot = Arc<AsyncMutex<SessionState>>;

/// The upload pipeline.
///
/// Cheap to clone; clones share the same set of in-progress sessions. Each
/// identifier has its own session lock, so uploads to different objects
/// never wait on each other.
#[derive(Clone)]
pub struct ChunkWriter {
    index: Arc<dyn MetadataIndex>,
    chunks: Arc<dyn ChunkStore>,
    sessions: Arc<Mutex<HashMap<ObjectId, SessionSlot>>>,
}

impl ChunkWriter {
    pub fn new(index: Arc<dyn MetadataIndex>, chunks: Arc<dyn ChunkStore>) -> Self {
        Self {
            index,
            chunks,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether this writer currently owns an in-progress session for `id`.
    pub fn is_active(&self, id: ObjectId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Allocate a fresh identifier and record it as `uploading`.
    ///
    /// A missing `filename` defaults to the identifier itself.
    pub async fn begin_upload(
        &self,
        filename: Option<String>,
        chunk_size: u64,
    ) -> StorageResult<ObjectId> {
        let id = ObjectId::new();
        let filename = filename
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| id.to_string());
        self.begin_upload_with_id(id, filename, chunk_size).await?;
        Ok(id)
    }

    async fn begin_upload_with_id(
        &self,
        id: ObjectId,
        filename: String,
        chunk_size: u64,
    ) -> StorageResult<()> {
        if !is_valid_chunk_size(chunk_size) {
            return Err(StorageError::InvalidChunkSize(chunk_size));
        }
        // The slot is claimed before the record exists; the sweep skips owned uploads.
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&id) {
                return Err(StorageError::Conflict {
                    id,
                    reason: "an upload is already in progress".into(),
                });
            }
            sessions.insert(id, Arc::new(AsyncMutex::new(SessionState::new(chunk_size))));
        }
        let record = ObjectRecord::uploading(id, filename, chunk_size);
        if let Err(err) = self.index.insert(&record).await {
            self.sessions.lock().remove(&id);
            return Err(err);
        }
        info!(object_id = %id, chunk_size, filename = %record.filename, "upload session started");
        Ok(())
    }

    /// Session slot for `id`, or the error a caller addressing it should see.
    async fn session(&self, id: ObjectId) -> StorageResult<SessionSlot> {
        let slot = self.sessions.lock().get(&id).cloned();
        if let Some(slot) = slot {
            return Ok(slot);
        }
        match self.index.lookup(id).await? {
            Some(record) => Err(StorageError::Conflict {
                id,
                reason: format!("object is {} and not owned by this writer", record.status),
            }),
            None => Err(StorageError::NotFound(id)),
        }
    }

    /// Write chunk `seq` of an uploading object.
    ///
    /// `seq` must be exactly the next expected sequence number; duplicates and
    /// gaps are a `Conflict`, as is a second caller writing the same object at
    /// the same time. A chunk store failure aborts the whole session.
    pub async fn write_chunk(&self, id: ObjectId, seq: u64, data: Bytes) -> StorageResult<ChunkAck> {
        let slot = self.session(id).await?;
        let mut state = slot.try_lock().map_err(|_| StorageError::Conflict {
            id,
            reason: "another writer holds this upload".into(),
        })?;

        if state.closed {
            return Err(StorageError::Conflict {
                id,
                reason: "upload session is closed".into(),
            });
        }
        if seq != state.next_seq {
            return Err(StorageError::Conflict {
                id,
                reason: format!("expected chunk {}, got {}", state.next_seq, seq),
            });
        }
        let chunk = Chunk::new(id, seq, data);
        let len = chunk.len();
        if chunk.is_empty() || len > state.chunk_size {
            return Err(StorageError::Corrupt {
                id,
                reason: format!(
                    "chunk {seq} has {len} bytes, chunk size is {}",
                    state.chunk_size
                ),
            });
        }
        if state.saw_short_chunk {
            return Err(StorageError::Corrupt {
                id,
                reason: format!("chunk {seq} follows a short final chunk"),
            });
        }

        if let Err(err) = self.chunks.put(id, seq, chunk.data.clone()).await {
            warn!(object_id = %id, seq, "chunk write failed, aborting upload: {}", err);
            drop(state);
            self.abort_upload(id).await;
            return Err(err);
        }

        state.digest.consume(&chunk.data);
        state.length += len;
        state.next_seq += 1;
        state.saw_short_chunk = len < state.chunk_size;
        debug!(object_id = %id, seq, len, "chunk acknowledged");
        Ok(ChunkAck {
            seq,
            len,
            total_len: state.length,
        })
    }

    /// Finalize an upload whose chunks total `total_length` bytes.
    ///
    /// A declared length that disagrees with what was written is `Corrupt`
    /// and leaves the session open. A failed metadata commit aborts it.
    pub async fn complete_upload(&self, id: ObjectId, total_length: u64) -> StorageResult<ObjectRecord> {
        let slot = self.session(id).await?;
        let mut state = slot.try_lock().map_err(|_| StorageError::Conflict {
            id,
            reason: "another writer holds this upload".into(),
        })?;

        if state.closed {
            return Err(StorageError::Conflict {
                id,
                reason: "upload session is closed".into(),
            });
        }
        if total_length != state.length {
            return Err(StorageError::Corrupt {
                id,
                reason: format!(
                    "declared length {total_length} but {} bytes were written",
                    state.length
                ),
            });
        }
        let count = state.next_seq;
        if count != chunk_count(state.length, state.chunk_size) {
            return Err(StorageError::Corrupt {
                id,
                reason: format!("{count} chunks written for {} bytes", state.length),
            });
        }

        let etag = format!("{:x}", state.digest.clone().compute());
        match self.index.complete(id, state.length, count, &etag).await {
            Ok(record) => {
                state.closed = true;
                drop(state);
                self.sessions.lock().remove(&id);
                info!(object_id = %id, length = record.length, chunks = count, "upload complete");
                Ok(record)
            }
            Err(err) => {
                warn!(object_id = %id, "metadata commit failed, aborting upload: {}", err);
                drop(state);
                self.abort_upload(id).await;
                Err(err)
            }
        }
    }

    /// Abandon an upload: mark it aborted, purge its chunks, drop the record.
    ///
    /// Best effort and infallible from the caller's point of view; anything
    /// left behind is reclaimed by the sweep. Complete or deleted objects are
    /// left untouched.
    pub async fn abort_upload(&self, id: ObjectId) -> AbortReport {
        let slot = self.sessions.lock().remove(&id);
        if let Some(slot) = slot {
            slot.lock().await.closed = true;
        }

        match self.index.lookup(id).await {
            Ok(Some(record)) if record.status.can_transition_to(ObjectStatus::Aborted) => {
                let mut aborted = record;
                aborted.status = ObjectStatus::Aborted;
                if let Err(err) = self.index.put(&aborted).await {
                    warn!(object_id = %id, "failed to mark upload aborted: {}", err);
                }
            }
            Ok(Some(record)) if record.status != ObjectStatus::Aborted => {
                debug!(object_id = %id, status = %record.status, "abort ignored");
                return AbortReport {
                    complete: true,
                    ..AbortReport::default()
                };
            }
            Ok(_) => {}
            Err(err) => warn!(object_id = %id, "failed to look up aborted upload: {}", err),
        }

        let mut report = AbortReport::default();
        let mut purged = false;
        match self.chunks.delete_all(id).await {
            Ok(purge) => {
                purged = purge.is_complete();
                report.purge = purge;
            }
            Err(err) => warn!(object_id = %id, "failed to purge aborted chunks: {}", err),
        }

        match self.index.remove(id).await {
            Ok(removed) => report.metadata_removed = removed,
            Err(err) => warn!(object_id = %id, "failed to remove aborted record: {}", err),
        }
        report.complete = purged && report.metadata_removed;

        info!(
            object_id = %id,
            chunks_removed = report.purge.chunks_removed,
            complete = report.complete,
            "upload aborted"
        );
        report
    }

    /// Upload a whole byte stream as one object.
    ///
    /// Holds at most one chunk in memory and waits for each chunk's durable
    /// write before pulling more input. Any source or store error aborts the
    /// upload, and so does dropping the returned future before it resolves.
    pub async fn upload_stream<S>(
        &self,
        filename: Option<String>,
        chunk_size: u64,
        stream: S,
    ) -> StorageResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let id = self.begin_upload(filename, chunk_size).await?;
        let mut guard = AbortOnDrop::new(self.clone(), id);

        let result = self.pump(id, chunk_size, stream).await;
        guard.disarm();
        if result.is_err() {
            self.abort_upload(id).await;
        }
        result
    }

    async fn pump<S>(&self, id: ObjectId, chunk_size: u64, stream: S) -> StorageResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut session = UploadSession::new(id, chunk_size);
        pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let mut bytes = item?;
            while !bytes.is_empty() {
                let take = session.room().min(bytes.len());
                session.fill(bytes.split_to(take));
                if let Some(chunk) = session.take_full() {
                    self.write_chunk(id, chunk.seq, chunk.data).await?;
                }
            }
        }
        if let Some(chunk) = session.take_rest() {
            self.write_chunk(id, chunk.seq, chunk.data).await?;
        }
        self.complete_upload(id, session.length).await
    }
}

/// Caller-side state of one streaming upload: the single-chunk buffer and the
/// running sequence counter. Owned by exactly one upload.
struct UploadSession {
    id: ObjectId,
    chunk_size: usize,
    next_seq: u64,
    length: u64,
    buffer: BytesMut,
}

impl UploadSession {
    fn new(id: ObjectId, chunk_size: u64) -> Self {
        let chunk_size = chunk_size as usize;
        Self {
            id,
            chunk_size,
            next_seq: 0,
            length: 0,
            buffer: BytesMut::with_capacity(chunk_size),
        }
    }

    fn room(&self) -> usize {
        self.chunk_size - self.buffer.len()
    }

    fn fill(&mut self, bytes: Bytes) {
        self.length += bytes.len() as u64;
        self.buffer.extend_from_slice(&bytes);
    }

    fn take_full(&mut self) -> Option<Chunk> {
        if self.buffer.len() < self.chunk_size {
            return None;
        }
        self.take_rest()
    }

    fn take_rest(&mut self) -> Option<Chunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let data = self.buffer.split().freeze();
        self.buffer.reserve(self.chunk_size);
        let chunk = Chunk::new(self.id, self.next_seq, data);
        self.next_seq += 1;
        Some(chunk)
    }
}

/// Aborts the upload if the owning future is dropped mid-flight.
struct AbortOnDrop {
    writer: Option<ChunkWriter>,
    id: ObjectId,
}

impl AbortOnDrop {
    fn new(writer: ChunkWriter, id: ObjectId) -> Self {
        Self {
            writer: Some(writer),
            id,
        }
    }

    fn disarm(&mut self) {
        self.writer = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(object_id = %id, "upload cancelled, scheduling abort");
                handle.spawn(async move {
                    writer.abort_upload(id).await;
                });
            }
            Err(_) => warn!(object_id = %id, "upload cancelled outside a runtime, leaving cleanup to sweep"),
        }
    }
}
