//! src/services/gc.rs
//!
//! Deletion and garbage collection.
//!
//! Deleting is two-phase: the metadata record is tombstoned first, so the
//! object vanishes from every read path at once, then the chunks are purged
//! in the background. If the process dies between the two phases the chunks
//! become orphans, which the reconciling sweep finds by diffing the chunk
//! store against the index. The sweep is idempotent and safe to run at any
//! time.

use crate::{
    models::object::{ObjectId, ObjectRecord, ObjectStatus},
    services::{
        chunk_store::{ChunkStore, PurgeReport},
        metadata_index::MetadataIndex,
        storage_service::{StorageError, StorageResult},
        writer::ChunkWriter,
    },
};
use chrono::Utc;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to the background chunk purge started by a delete.
#[derive(Debug)]
pub struct PurgeHandle(JoinHandle<StorageResult<PurgeReport>>);

impl PurgeHandle {
    /// Wait for the purge to finish.
    pub async fn wait(self) -> StorageResult<PurgeReport> {
        self.0
            .await
            .map_err(|err| StorageError::IoFailure(format!("purge task failed: {err}")))?
    }
}

/// Result of a successful delete: the tombstoned record and its pending purge.
#[derive(Debug)]
pub struct DeleteReceipt {
    pub record: ObjectRecord,
    pub purge: PurgeHandle,
}

/// Tombstone-then-purge deletion.
#[derive(Clone)]
pub struct Deleter {
    index: Arc<dyn MetadataIndex>,
    chunks: Arc<dyn ChunkStore>,
}

impl Deleter {
    pub fn new(index: Arc<dyn MetadataIndex>, chunks: Arc<dyn ChunkStore>) -> Self {
        Self { index, chunks }
    }

    /// Delete a complete object.
    ///
    /// Returns once the tombstone is durable; from then on the object is
    /// invisible. Chunk removal runs asynchronously. Missing, deleted and
    /// still-uploading objects are `NotFound`.
    pub async fn delete(&self, id: ObjectId) -> StorageResult<DeleteReceipt> {
        let record = self.index.get(id).await?;
        if record.status != ObjectStatus::Complete {
            return Err(StorageError::NotFound(id));
        }
        let record = self.index.tombstone(id).await?;
        info!(object_id = %id, "object tombstoned");

        let chunks = self.chunks.clone();
        let purge = tokio::spawn(async move {
            match chunks.delete_all(id).await {
                Ok(report) => {
                    if report.is_complete() {
                        info!(object_id = %id, chunks = report.chunks_removed, "chunks purged");
                    } else {
                        warn!(
                            object_id = %id,
                            removed = report.chunks_removed,
                            failed = report.chunks_failed,
                            "partial purge, leaving the rest to sweep"
                        );
                    }
                    Ok(report)
                }
                Err(err) => {
                    warn!(object_id = %id, "purge failed, leaving it to sweep: {}", err);
                    Err(err)
                }
            }
        });

        Ok(DeleteReceipt {
            record,
            purge: PurgeHandle(purge),
        })
    }
}

/// Statistics from one reconciling sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Chunk-owning identifiers examined.
    pub owners_scanned: u64,
    /// Chunk sets purged because their owner was missing, aborted or deleted.
    pub orphans_purged: u64,
    /// Uploads abandoned past their time-to-live and aborted.
    pub stale_uploads_aborted: u64,
    pub chunks_removed: u64,
    pub errors: u64,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.orphans_purged == 0 && self.stale_uploads_aborted == 0 && self.errors == 0
    }
}

/// Reconciles the chunk store against the metadata index.
#[derive(Clone)]
pub struct Sweeper {
    index: Arc<dyn MetadataIndex>,
    chunks: Arc<dyn ChunkStore>,
    writer: ChunkWriter,
    upload_ttl: Duration,
}

impl Sweeper {
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        chunks: Arc<dyn ChunkStore>,
        writer: ChunkWriter,
        upload_ttl: Duration,
    ) -> Self {
        Self {
            index,
            chunks,
            writer,
            upload_ttl,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// 1. Uploads older than the TTL that no live writer owns are aborted.
    /// 2. Every chunk set whose owner is missing, aborted or tombstoned is purged.
    ///
    /// Complete objects and uploads still owned by a writer are never touched.
    pub async fn sweep(&self) -> StorageResult<SweepReport> {
        let mut report = SweepReport::default();

        let ttl = chrono::Duration::from_std(self.upload_ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(ttl).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        for record in self.index.stale_uploads(cutoff).await? {
            if self.writer.is_active(record.id) {
                continue;
            }
            let abort = self.writer.abort_upload(record.id).await;
            report.stale_uploads_aborted += 1;
            report.chunks_removed += abort.purge.chunks_removed;
            if !abort.complete {
                report.errors += 1;
            }
        }

        for id in self.chunks.owners().await? {
            report.owners_scanned += 1;
            let owner = match self.index.lookup(id).await {
                Ok(owner) => owner,
                Err(err) => {
                    warn!(object_id = %id, "sweep lookup failed: {}", err);
                    report.errors += 1;
                    continue;
                }
            };
            let orphaned = match owner.as_ref().map(|record| record.status) {
                None | Some(ObjectStatus::Aborted) | Some(ObjectStatus::Deleted) => true,
                Some(ObjectStatus::Uploading) | Some(ObjectStatus::Complete) => false,
            };
            if !orphaned {
                continue;
            }

            match self.chunks.delete_all(id).await {
                Ok(purge) => {
                    debug!(object_id = %id, chunks = purge.chunks_removed, "orphan chunks purged");
                    report.orphans_purged += 1;
                    report.chunks_removed += purge.chunks_removed;
                    if !purge.is_complete() {
                        report.errors += 1;
                    }
                }
                Err(err) => {
                    warn!(object_id = %id, "sweep purge failed: {}", err);
                    report.errors += 1;
                    continue;
                }
            }

            if owner.is_some_and(|record| record.status == ObjectStatus::Aborted) {
                if let Err(err) = self.index.remove(id).await {
                    warn!(object_id = %id, "failed to drop aborted record: {}", err);
                    report.errors += 1;
                }
            }
        }

        if report.is_noop() {
            debug!(owners = report.owners_scanned, "sweep found nothing to reclaim");
        } else {
            info!(
                owners = report.owners_scanned,
                orphans = report.orphans_purged,
                stale_uploads = report.stale_uploads_aborted,
                chunks = report.chunks_removed,
                errors = report.errors,
                "sweep reclaimed storage"
            );
        }
        Ok(report)
    }

    /// Run `sweep` every `interval` on a background task until `shutdown`
    /// fires. The first tick is immediate.
    pub fn spawn_periodic(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(err) = self.sweep().await {
                    warn!("sweep failed: {}", err);
                }
            }
            debug!("sweeper stopped");
        })
    }
}
