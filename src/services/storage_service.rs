//! src/services/storage_service.rs
//!
//! StorageService: the store's public API. Wires the upload pipeline, the
//! download pipeline and deletion/GC around one metadata index and one chunk
//! store, both injected at construction. Handlers only talk to this type.

use crate::models::{
    chunk::{DEFAULT_CHUNK_SIZE, is_valid_chunk_size},
    object::{ObjectId, ObjectRecord, ObjectStatus},
};
use crate::services::{
    chunk_store::ChunkStore,
    gc::{DeleteReceipt, Deleter, SweepReport, Sweeper},
    metadata_index::{ListCursor, MAX_PAGE_SIZE, MetadataIndex, list_stream},
    reader::{ChunkReader, Download},
    writer::ChunkWriter,
};
use bytes::Bytes;
use futures::{Stream, StreamExt, future, stream::BoxStream};
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object id `{0}`")]
    InvalidId(String),
    #[error("chunk size {0} is outside the accepted range")]
    InvalidChunkSize(u64),
    #[error("invalid continuation token `{0}`")]
    InvalidContinuationToken(String),
    #[error("object `{0}` not found")]
    NotFound(ObjectId),
    #[error("object `{id}` conflict: {reason}")]
    Conflict { id: ObjectId, reason: String },
    #[error("object `{id}` is corrupt: {reason}")]
    Corrupt { id: ObjectId, reason: String },
    #[error("storage I/O failure: {0}")]
    IoFailure(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Caller-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: identifier, chunk size or continuation token.
    InvalidInput,
    NotFound,
    Conflict,
    Corrupt,
    /// Backing store unreachable or write rejected.
    IoFailure,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidId(_) | Self::InvalidChunkSize(_) | Self::InvalidContinuationToken(_) => {
                ErrorKind::InvalidInput
            }
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Corrupt { .. } => ErrorKind::Corrupt,
            Self::IoFailure(_) | Self::Sqlx(_) | Self::Io(_) => ErrorKind::IoFailure,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Tunables for a `StorageService`.
#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// Chunk size used when an upload does not ask for one.
    pub default_chunk_size: u64,
    /// Age after which an upload nobody owns is considered abandoned.
    pub upload_ttl: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            upload_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListObjectsParams {
    pub continuation_token: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    /// Complete objects only. A page may hold fewer than `max_keys` entries
    /// when in-progress uploads fall inside it.
    pub objects: Vec<ObjectRecord>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// StorageService provides the chunked object operations:
/// - Create an object from a byte stream
/// - Open an object for streaming download
/// - Look up or list object metadata
/// - Delete an object (tombstone now, purge chunks later)
/// - Reconcile orphaned chunks
#[derive(Clone)]
pub struct StorageService {
    pub index: Arc<dyn MetadataIndex>,
    pub chunks: Arc<dyn ChunkStore>,
    writer: ChunkWriter,
    reader: ChunkReader,
    deleter: Deleter,
    sweeper: Sweeper,
    default_chunk_size: u64,
}

impl StorageService {
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        chunks: Arc<dyn ChunkStore>,
        settings: StoreSettings,
    ) -> Self {
        let writer = ChunkWriter::new(index.clone(), chunks.clone());
        let reader = ChunkReader::new(index.clone(), chunks.clone());
        let deleter = Deleter::new(index.clone(), chunks.clone());
        let sweeper = Sweeper::new(
            index.clone(),
            chunks.clone(),
            writer.clone(),
            settings.upload_ttl,
        );
        Self {
            index,
            chunks,
            writer,
            reader,
            deleter,
            sweeper,
            default_chunk_size: settings.default_chunk_size,
        }
    }

    pub fn writer(&self) -> &ChunkWriter {
        &self.writer
    }

    /// Parse a caller-supplied identifier.
    pub fn parse_id(raw: &str) -> StorageResult<ObjectId> {
        raw.trim()
            .parse::<ObjectId>()
            .map_err(|_| StorageError::InvalidId(raw.to_string()))
    }

    fn resolve_chunk_size(&self, requested: Option<u64>) -> StorageResult<u64> {
        let chunk_size = requested.unwrap_or(self.default_chunk_size);
        if !is_valid_chunk_size(chunk_size) {
            return Err(StorageError::InvalidChunkSize(chunk_size));
        }
        Ok(chunk_size)
    }

    /// Stream-upload a new object.
    ///
    /// On any failure the partial upload is aborted and nothing becomes
    /// visible. Dropping the future mid-upload aborts it as well.
    pub async fn upload_object_stream<S>(
        &self,
        filename: Option<String>,
        chunk_size: Option<u64>,
        stream: S,
    ) -> StorageResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let chunk_size = self.resolve_chunk_size(chunk_size)?;
        self.writer.upload_stream(filename, chunk_size, stream).await
    }

    /// Open a complete object for streaming.
    pub async fn get_object_reader(&self, id: ObjectId) -> StorageResult<Download> {
        self.reader.open_download(id).await
    }

    /// Metadata of a complete object.
    pub async fn get_object_metadata(&self, id: ObjectId) -> StorageResult<ObjectRecord> {
        let record = self.index.get(id).await?;
        if record.status != ObjectStatus::Complete {
            return Err(StorageError::NotFound(id));
        }
        Ok(record)
    }

    /// One page of complete objects in upload order.
    pub async fn list_objects(&self, params: ListObjectsParams) -> StorageResult<ListObjectsResult> {
        let cursor = params
            .continuation_token
            .as_deref()
            .map(ListCursor::from_token)
            .transpose()?;
        let max_keys = params.max_keys.clamp(1, MAX_PAGE_SIZE);

        let page = self.index.list_page(cursor, max_keys).await?;
        let objects = page
            .objects
            .into_iter()
            .filter(|record| record.status == ObjectStatus::Complete)
            .collect();

        Ok(ListObjectsResult {
            objects,
            is_truncated: page.next_cursor.is_some(),
            next_continuation_token: page.next_cursor.map(|cursor| cursor.to_token()),
        })
    }

    /// Every complete object, enumerated lazily.
    pub fn list_all(&self) -> BoxStream<'static, StorageResult<ObjectRecord>> {
        list_stream(self.index.clone(), None, MAX_PAGE_SIZE)
            .filter(|item| {
                future::ready(match item {
                    Ok(record) => record.status == ObjectStatus::Complete,
                    Err(_) => true,
                })
            })
            .boxed()
    }

    /// Tombstone a complete object and start purging its chunks.
    pub async fn delete_object(&self, id: ObjectId) -> StorageResult<DeleteReceipt> {
        self.deleter.delete(id).await
    }

    /// Run one reconciling sweep now.
    pub async fn sweep(&self) -> StorageResult<SweepReport> {
        self.sweeper.sweep().await
    }

    /// Start the periodic background sweep; it stops when `shutdown` fires.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        self.sweeper.clone().spawn_periodic(interval, shutdown)
    }
}
