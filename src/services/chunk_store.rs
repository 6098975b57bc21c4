//! src/services/chunk_store.rs
//!
//! Chunk Store: durable map from `(object id, sequence number)` to a byte
//! block. The filesystem backend shards object directories beneath
//! `base_path/{h0}/{h1}/{object_id}/` where `h0`/`h1` come from MD5(id), and
//! writes each chunk through a temp file + fsync + rename.

use crate::{
    models::object::ObjectId,
    services::storage_service::{StorageError, StorageResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const CHUNK_EXTENSION: &str = "chunk";
const TMP_PREFIX: &str = ".tmp-";

/// Outcome of a bulk chunk removal.
///
/// A purge that failed on some chunks is reported rather than raised so the
/// caller can tell partial from total success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub chunks_removed: u64,
    pub chunks_failed: u64,
}

impl PurgeReport {
    pub fn is_complete(&self) -> bool {
        self.chunks_failed == 0
    }
}

/// Storage for chunk payloads.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Durably write chunk `seq` of `id`, replacing any previous content.
    async fn put(&self, id: ObjectId, seq: u64, data: Bytes) -> StorageResult<()>;

    /// Read chunk `seq` of `id`. `None` if no such chunk exists.
    async fn get(&self, id: ObjectId, seq: u64) -> StorageResult<Option<Bytes>>;

    /// Remove every chunk belonging to `id`. Removing nothing is not an error.
    async fn delete_all(&self, id: ObjectId) -> StorageResult<PurgeReport>;

    /// Every object identifier that currently owns at least one stored chunk
    /// directory.
    async fn owners(&self) -> StorageResult<Vec<ObjectId>>;

    /// Short identifier used in logs.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend accepts writes.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Chunk store on the local filesystem.
#[derive(Clone, Debug)]
pub struct FsChunkStore {
    /// Base directory on disk where chunk payloads are stored.
    pub base_path: PathBuf,
}

impl FsChunkStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Two-level shard directory names for an object: the first two bytes of
    /// MD5(id) as lowercase hex.
    fn object_shards(id: ObjectId) -> (String, String) {
        let digest = md5::compute(id.as_uuid().as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_dir(&self, id: ObjectId) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.to_string());
        path
    }

    fn chunk_path(&self, id: ObjectId, seq: u64) -> PathBuf {
        self.object_dir(id)
            .join(format!("{seq:010}.{CHUNK_EXTENSION}"))
    }

    /// Remove empty directories from `start` upward, stopping below `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Subdirectory names of `dir`; a missing directory reads as empty.
    async fn subdirs(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push((name.to_string(), entry.path()));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn put(&self, id: ObjectId, seq: u64, data: Bytes) -> StorageResult<()> {
        let dir = self.object_dir(id);
        fs::create_dir_all(&dir).await?;
        let final_path = self.chunk_path(id, seq);
        let tmp_path = dir.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));

        let result: io::Result<()> = async {
            // A concurrent purge may have pruned a shared shard directory.
            let mut file = match File::create(&tmp_path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    fs::create_dir_all(&dir).await?;
                    File::create(&tmp_path).await?
                }
                Err(err) => return Err(err),
            };
            file.write_all(&data).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &final_path).await
        }
        .await;

        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        debug!(object_id = %id, seq, bytes = data.len(), "chunk written");
        Ok(())
    }

    async fn get(&self, id: ObjectId, seq: u64) -> StorageResult<Option<Bytes>> {
        match fs::read(self.chunk_path(id, seq)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete_all(&self, id: ObjectId) -> StorageResult<PurgeReport> {
        let dir = self.object_dir(id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(PurgeReport::default()),
            Err(err) => return Err(StorageError::Io(err)),
        };

        let mut report = PurgeReport::default();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_chunk = path.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXTENSION);
            match fs::remove_file(&path).await {
                Ok(_) if is_chunk => report.chunks_removed += 1,
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("failed to remove {}: {}", path.display(), err);
                    if is_chunk {
                        report.chunks_failed += 1;
                    }
                }
            }
        }

        if report.is_complete() {
            self.prune_empty_dirs(&dir, &self.base_path).await;
        }
        debug!(
            object_id = %id,
            removed = report.chunks_removed,
            failed = report.chunks_failed,
            "purged chunk directory"
        );
        Ok(report)
    }

    async fn owners(&self) -> StorageResult<Vec<ObjectId>> {
        let mut owners = Vec::new();
        for (_, shard_a) in Self::subdirs(&self.base_path).await? {
            for (_, shard_b) in Self::subdirs(&shard_a).await? {
                for (name, _) in Self::subdirs(&shard_b).await? {
                    match name.parse::<ObjectId>() {
                        Ok(id) => owners.push(id),
                        Err(_) => debug!("ignoring foreign directory {}", name),
                    }
                }
            }
        }
        Ok(owners)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    /// Write, read back and remove a probe file beneath `base_path`.
    async fn health_check(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&probe, b"readyz").await?;
        let read = fs::read(&probe).await;
        let _ = fs::remove_file(&probe).await;
        if read? != b"readyz" {
            return Err(StorageError::IoFailure("probe file content mismatch".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsChunkStore) {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = FsChunkStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_returns_payload() {
        let (_dir, store) = store();
        let id = ObjectId::new();
        store.put(id, 0, Bytes::from_static(b"abcd")).await.unwrap();
        store.put(id, 1, Bytes::from_static(b"ef")).await.unwrap();

        assert_eq!(store.get(id, 0).await.unwrap().unwrap(), &b"abcd"[..]);
        assert_eq!(store.get(id, 1).await.unwrap().unwrap(), &b"ef"[..]);
        assert!(store.get(id, 2).await.unwrap().is_none());
        assert!(store.get(ObjectId::new(), 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_existing_chunk() {
        let (_dir, store) = store();
        let id = ObjectId::new();
        store.put(id, 0, Bytes::from_static(b"old")).await.unwrap();
        store.put(id, 0, Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(store.get(id, 0).await.unwrap().unwrap(), &b"new"[..]);
    }

    #[tokio::test]
    async fn delete_all_reports_and_prunes() {
        let (dir, store) = store();
        let id = ObjectId::new();
        for seq in 0..3 {
            store.put(id, seq, Bytes::from_static(b"x")).await.unwrap();
        }

        let report = store.delete_all(id).await.unwrap();
        assert_eq!(report.chunks_removed, 3);
        assert!(report.is_complete());
        assert!(store.get(id, 0).await.unwrap().is_none());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

        let again = store.delete_all(id).await.unwrap();
        assert_eq!(again, PurgeReport::default());
    }

    #[tokio::test]
    async fn delete_all_leaves_other_objects() {
        let (_dir, store) = store();
        let (a, b) = (ObjectId::new(), ObjectId::new());
        store.put(a, 0, Bytes::from_static(b"a")).await.unwrap();
        store.put(b, 0, Bytes::from_static(b"b")).await.unwrap();

        store.delete_all(a).await.unwrap();
        assert_eq!(store.get(b, 0).await.unwrap().unwrap(), &b"b"[..]);
    }

    #[tokio::test]
    async fn owners_lists_object_directories() {
        let (_dir, store) = store();
        let (a, b) = (ObjectId::new(), ObjectId::new());
        store.put(a, 0, Bytes::from_static(b"a")).await.unwrap();
        store.put(b, 0, Bytes::from_static(b"b")).await.unwrap();

        let mut owners = store.owners().await.unwrap();
        owners.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(owners, expected);
    }

    #[tokio::test]
    async fn owners_of_missing_base_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsChunkStore::new(dir.path().join("absent"));
        assert!(store.owners().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_check_probes_disk() {
        let (_dir, store) = store();
        store.health_check().await.unwrap();
    }
}
