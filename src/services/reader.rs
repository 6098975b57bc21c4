//! src/services/reader.rs
//!
//! Chunk Reader: the download pipeline. Streams an object's chunks back in
//! strict sequence order, one chunk in memory at a time, and validates every
//! chunk against the length the chunking law predicts.
//!
//! Bytes already handed to the caller are never retracted: a failure part-way
//! through (I/O, a chunk purged by a concurrent delete, checksum mismatch) is
//! reported as an error after whatever was emitted so far. Callers that need
//! all-or-nothing semantics must buffer on their side.

use crate::{
    models::{
        chunk::{chunk_count, expected_chunk_len},
        object::{ObjectId, ObjectRecord},
    },
    services::{
        chunk_store::ChunkStore,
        metadata_index::MetadataIndex,
        storage_service::{StorageError, StorageResult},
    },
};
use bytes::Bytes;
use futures::{Stream, stream};
use std::sync::Arc;
use tracing::{debug, warn};

/// The download pipeline.
#[derive(Clone)]
pub struct ChunkReader {
    index: Arc<dyn MetadataIndex>,
    chunks: Arc<dyn ChunkStore>,
}

impl ChunkReader {
    pub fn new(index: Arc<dyn MetadataIndex>, chunks: Arc<dyn ChunkStore>) -> Self {
        Self { index, chunks }
    }

    /// Open a complete object for streaming.
    ///
    /// Uploading, aborted and deleted objects are all `NotFound`.
    pub async fn open_download(&self, id: ObjectId) -> StorageResult<Download> {
        let record = self.index.get(id).await?;
        if !record.status.is_readable() {
            return Err(StorageError::NotFound(id));
        }
        let expected = chunk_count(record.length(), record.chunk_size());
        if record.chunk_size() == 0 || expected != record.chunk_count() {
            return Err(StorageError::Corrupt {
                id,
                reason: format!(
                    "record lists {} chunks, {} bytes at chunk size {} needs {}",
                    record.chunk_count, record.length, record.chunk_size, expected
                ),
            });
        }
        debug!(object_id = %id, chunks = expected, "download opened");
        Ok(Download {
            record,
            chunks: self.chunks.clone(),
            next_seq: 0,
            digest: Some(md5::Context::new()),
            closed: false,
        })
    }
}

/// An open download session. Owned by exactly one reader.
pub struct Download {
    record: ObjectRecord,
    chunks: Arc<dyn ChunkStore>,
    next_seq: u64,
    digest: Option<md5::Context>,
    closed: bool,
}

impl Download {
    pub fn record(&self) -> &ObjectRecord {
        &self.record
    }

    /// Fetch the next chunk in sequence, or `None` once the object is exhausted
    /// (or the download closed).
    ///
    /// A missing chunk, a chunk of the wrong length, or a checksum mismatch at
    /// the end is `Corrupt`; it is never reported as end of stream.
    pub async fn next_chunk(&mut self) -> StorageResult<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        let id = self.record.id;
        let seq = self.next_seq;

        let Some(expected) = expected_chunk_len(self.record.length(), self.record.chunk_size(), seq)
        else {
            self.finish()?;
            return Ok(None);
        };

        let data = match self.chunks.get(id, seq).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                self.close();
                warn!(object_id = %id, seq, "chunk missing mid-stream");
                return Err(StorageError::Corrupt {
                    id,
                    reason: format!("chunk {seq} is missing"),
                });
            }
            Err(err) => {
                self.close();
                return Err(err);
            }
        };

        if data.len() as u64 != expected {
            self.close();
            return Err(StorageError::Corrupt {
                id,
                reason: format!("chunk {seq} has {} bytes, expected {expected}", data.len()),
            });
        }

        if let Some(digest) = self.digest.as_mut() {
            digest.consume(&data);
        }
        self.next_seq += 1;
        Ok(Some(data))
    }

    /// Verify the payload checksum once every chunk was read.
    fn finish(&mut self) -> StorageResult<()> {
        let digest = self.digest.take();
        self.close();
        let (Some(digest), Some(etag)) = (digest, self.record.etag.as_deref()) else {
            return Ok(());
        };
        let actual = format!("{:x}", digest.compute());
        if actual != etag {
            return Err(StorageError::Corrupt {
                id: self.record.id,
                reason: format!("checksum {actual} does not match recorded {etag}"),
            });
        }
        debug!(object_id = %self.record.id, "download finished");
        Ok(())
    }

    /// Release the session. Safe to call any number of times.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Consume the session as a byte stream ending after the last chunk or
    /// the first error.
    pub fn into_stream(self) -> impl Stream<Item = StorageResult<Bytes>> + Send + 'static {
        stream::try_unfold(self, |mut download| async move {
            let chunk = download.next_chunk().await?;
            Ok::<_, StorageError>(chunk.map(|chunk| (chunk, download)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::ObjectStatus,
        services::{
            chunk_store::FsChunkStore, metadata_index::SqliteMetadataIndex, writer::ChunkWriter,
        },
    };
    use futures::{TryStreamExt, stream};
    use std::io;

    struct Fixture {
        _dir: tempfile::TempDir,
        writer: ChunkWriter,
        reader: ChunkReader,
        index: Arc<dyn MetadataIndex>,
        chunks: Arc<dyn ChunkStore>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let index: Arc<dyn MetadataIndex> = Arc::new(SqliteMetadataIndex::in_memory().await.unwrap());
        let chunks: Arc<dyn ChunkStore> = Arc::new(FsChunkStore::new(dir.path()));
        Fixture {
            _dir: dir,
            writer: ChunkWriter::new(index.clone(), chunks.clone()),
            reader: ChunkReader::new(index.clone(), chunks.clone()),
            index,
            chunks,
        }
    }

    async fn upload(writer: &ChunkWriter, data: &'static [u8], chunk_size: u64) -> ObjectRecord {
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(data))]);
        writer.upload_stream(None, chunk_size, body).await.unwrap()
    }

    #[tokio::test]
    async fn streams_chunks_in_order() {
        let f = fixture().await;
        let record = upload(&f.writer, b"hello chunked world", 5).await;

        let mut download = f.reader.open_download(record.id).await.unwrap();
        let mut out = Vec::new();
        let mut sizes = Vec::new();
        while let Some(chunk) = download.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello chunked world");
        assert_eq!(sizes, vec![5, 5, 5, 4]);
        assert!(download.is_closed());
    }

    #[tokio::test]
    async fn into_stream_collects_payload() {
        let f = fixture().await;
        let record = upload(&f.writer, b"0123456789", 3).await;

        let download = f.reader.open_download(record.id).await.unwrap();
        let parts: Vec<Bytes> = download.into_stream().try_collect().await.unwrap();
        assert_eq!(parts.concat(), b"0123456789");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let f = fixture().await;
        assert!(matches!(
            f.reader.open_download(ObjectId::new()).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn uploading_and_deleted_objects_are_not_found() {
        let f = fixture().await;
        let pending = f.writer.begin_upload(None, 4).await.unwrap();
        assert!(matches!(
            f.reader.open_download(pending).await,
            Err(StorageError::NotFound(_))
        ));

        let record = upload(&f.writer, b"abcd", 4).await;
        f.index.tombstone(record.id).await.unwrap();
        assert!(matches!(
            f.reader.open_download(record.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_chunk_is_corrupt_not_eof() {
        let f = fixture().await;
        let record = upload(&f.writer, b"abcdefgh", 4).await;

        let mut download = f.reader.open_download(record.id).await.unwrap();
        assert_eq!(download.next_chunk().await.unwrap().unwrap(), &b"abcd"[..]);

        f.chunks.delete_all(record.id).await.unwrap();
        let err = download.next_chunk().await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
        assert!(download.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_chunk_is_corrupt() {
        let f = fixture().await;
        let record = upload(&f.writer, b"abcdefgh", 4).await;
        f.chunks.put(record.id, 0, Bytes::from_static(b"ab")).await.unwrap();

        let mut download = f.reader.open_download(record.id).await.unwrap();
        assert!(matches!(
            download.next_chunk().await,
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn tampered_payload_fails_checksum() {
        let f = fixture().await;
        let record = upload(&f.writer, b"abcdefgh", 4).await;
        f.chunks.put(record.id, 1, Bytes::from_static(b"XXXX")).await.unwrap();

        let download = f.reader.open_download(record.id).await.unwrap();
        let result: StorageResult<Vec<Bytes>> = download.into_stream().try_collect().await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let f = fixture().await;
        let record = upload(&f.writer, b"abcd", 4).await;
        assert_eq!(record.status, ObjectStatus::Complete);

        let mut download = f.reader.open_download(record.id).await.unwrap();
        download.close();
        download.close();
        assert!(download.next_chunk().await.unwrap().is_none());
    }
}
