//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chunk_store::{
    models::object::ObjectId,
    routes::routes::routes,
    services::{
        chunk_store::{ChunkStore, FsChunkStore, PurgeReport},
        metadata_index::{MetadataIndex, SqliteMetadataIndex},
        storage_service::{StorageError, StorageResult, StorageService, StoreSettings},
    },
};
use futures::stream;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tempfile::TempDir;
use tokio::sync::Notify;

/// A store service over a temp directory and a private in-memory index.
pub struct TestStore {
    pub service: StorageService,
    pub index: Arc<dyn MetadataIndex>,
    pub chunks: Arc<FaultyChunkStore>,
    _dir: TempDir,
}

impl TestStore {
    pub async fn new(default_chunk_size: u64) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let index: Arc<dyn MetadataIndex> = Arc::new(
            SqliteMetadataIndex::in_memory()
                .await
                .expect("in-memory index"),
        );
        let chunks = Arc::new(FaultyChunkStore::new(FsChunkStore::new(dir.path())));
        let service = StorageService::new(
            index.clone(),
            chunks.clone(),
            StoreSettings {
                default_chunk_size,
                ..StoreSettings::default()
            },
        );
        Self {
            service,
            index,
            chunks,
            _dir: dir,
        }
    }

    pub fn router(&self) -> axum::Router {
        routes().with_state(self.service.clone())
    }
}

/// Feed `data` to an upload in pieces of `piece` bytes.
pub fn body_of(data: &[u8], piece: usize) -> stream::Iter<std::vec::IntoIter<io::Result<Bytes>>> {
    let parts: Vec<io::Result<Bytes>> = data
        .chunks(piece.max(1))
        .map(|part| Ok(Bytes::copy_from_slice(part)))
        .collect();
    stream::iter(parts)
}

/// Deterministic, non-repeating-at-chunk-boundaries test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Chunk store wrapper that injects failures into an `FsChunkStore`.
pub struct FaultyChunkStore {
    inner: FsChunkStore,
    puts_before_failure: AtomicU64,
    hidden: Mutex<HashSet<(ObjectId, u64)>>,
    held: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

impl FaultyChunkStore {
    pub fn new(inner: FsChunkStore) -> Self {
        Self {
            inner,
            puts_before_failure: AtomicU64::new(u64::MAX),
            hidden: Mutex::new(HashSet::new()),
            held: Mutex::new(None),
            entered: Notify::new(),
        }
    }

    /// Let `n` more puts succeed, then reject every put after that.
    pub fn fail_puts_after(&self, n: u64) {
        self.puts_before_failure.store(n, Ordering::SeqCst);
    }

    /// Make one chunk read back as missing.
    pub fn hide_chunk(&self, id: ObjectId, seq: u64) {
        self.hidden.lock().insert((id, seq));
    }

    /// Park the next put until `release_puts` is called.
    pub fn hold_puts(&self) {
        *self.held.lock() = Some(Arc::new(Notify::new()));
    }

    /// Resolves once a put is parked by `hold_puts`.
    pub async fn put_parked(&self) {
        self.entered.notified().await;
    }

    pub fn release_puts(&self) {
        if let Some(gate) = self.held.lock().take() {
            gate.notify_one();
        }
    }

    pub fn inner(&self) -> &FsChunkStore {
        &self.inner
    }
}

#[async_trait]
impl ChunkStore for FaultyChunkStore {
    async fn put(&self, id: ObjectId, seq: u64, data: Bytes) -> StorageResult<()> {
        let allowed = self
            .puts_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if !allowed {
            return Err(StorageError::IoFailure("injected write failure".into()));
        }
        let gate = self.held.lock().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        self.inner.put(id, seq, data).await
    }

    async fn get(&self, id: ObjectId, seq: u64) -> StorageResult<Option<Bytes>> {
        if self.hidden.lock().contains(&(id, seq)) {
            return Ok(None);
        }
        self.inner.get(id, seq).await
    }

    async fn delete_all(&self, id: ObjectId) -> StorageResult<PurgeReport> {
        self.inner.delete_all(id).await
    }

    async fn owners(&self) -> StorageResult<Vec<ObjectId>> {
        self.inner.owners().await
    }

    fn backend_name(&self) -> &'static str {
        "faulty_fs"
    }
}
