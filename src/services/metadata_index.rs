//! src/services/metadata_index.rs
//!
//! Metadata Index: durable map from object identifier to `ObjectRecord`,
//! backed by SQLite. Records are never physically removed once complete:
//! deletion flips them to `deleted` in place so the identifier stays taken.

use crate::{
    models::object::{ObjectId, ObjectRecord, ObjectStatus},
    services::storage_service::{StorageError, StorageResult},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::debug;

/// Largest page a single `list_page` call returns.
pub const MAX_PAGE_SIZE: usize = 1000;

const OBJECT_COLUMNS: &str =
    "seq, id, filename, length, chunk_size, chunk_count, etag, status, upload_date";

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Position in an enumeration: everything inserted after `seq`.
///
/// Keyset cursors keep listings stable under concurrent inserts and deletes.
/// New rows always receive a larger `seq`, so a row that existed for the
/// whole enumeration is neither skipped nor returned twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListCursor(i64);

impl ListCursor {
    pub fn after(seq: i64) -> Self {
        Self(seq)
    }

    pub fn seq(&self) -> i64 {
        self.0
    }

    /// Encode as an opaque continuation token.
    pub fn to_token(&self) -> String {
        general_purpose::STANDARD.encode(self.0.to_string())
    }

    /// Decode a token previously produced by `to_token`.
    pub fn from_token(token: &str) -> StorageResult<Self> {
        general_purpose::STANDARD
            .decode(token)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|seq| *seq >= 0)
            .map(Self)
            .ok_or_else(|| StorageError::InvalidContinuationToken(token.to_string()))
    }
}

/// One page of a listing.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub objects: Vec<ObjectRecord>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<ListCursor>,
}

/// Durable index of object metadata.
#[async_trait]
pub trait MetadataIndex: Send + Sync + 'static {
    /// Insert a new record. Fails with `Conflict` if the identifier is taken,
    /// including by a tombstoned record.
    async fn insert(&self, record: &ObjectRecord) -> StorageResult<ObjectRecord>;

    /// Insert-or-replace by identifier. Replacement keeps the original
    /// insertion sequence.
    async fn put(&self, record: &ObjectRecord) -> StorageResult<ObjectRecord>;

    /// Fetch a live record. Tombstoned or missing records are `NotFound`.
    async fn get(&self, id: ObjectId) -> StorageResult<ObjectRecord>;

    /// Fetch a record regardless of status, tombstones included.
    async fn lookup(&self, id: ObjectId) -> StorageResult<Option<ObjectRecord>>;

    /// `Uploading -> Complete`, recording final length, chunk count and etag.
    /// Fails with `Conflict` if the record is not uploading.
    async fn complete(
        &self,
        id: ObjectId,
        length: u64,
        chunk_count: u64,
        etag: &str,
    ) -> StorageResult<ObjectRecord>;

    /// `Complete -> Deleted` in place. Fails with `NotFound` if the record is
    /// missing or not complete.
    async fn tombstone(&self, id: ObjectId) -> StorageResult<ObjectRecord>;

    /// Physically remove an uploading or aborted record. Complete and
    /// tombstoned records are never removed. Returns whether a row went away.
    async fn remove(&self, id: ObjectId) -> StorageResult<bool>;

    /// Up to `limit` non-deleted records inserted after `after`, in insertion order.
    async fn list_page(&self, after: Option<ListCursor>, limit: usize) -> StorageResult<ListPage>;

    /// Uploading records whose session began before `started_before`.
    async fn stale_uploads(&self, started_before: DateTime<Utc>)
    -> StorageResult<Vec<ObjectRecord>>;

    /// Verify the backing database answers queries.
    async fn health_check(&self) -> StorageResult<()>;
}

/// Lazily enumerate every non-deleted record from `start`, one page at a time.
///
/// The stream is finite and restartable: resuming from the cursor of the last
/// record seen continues where the previous enumeration stopped.
pub fn list_stream(
    index: Arc<dyn MetadataIndex>,
    start: Option<ListCursor>,
    page_size: usize,
) -> BoxStream<'static, StorageResult<ObjectRecord>> {
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    stream::try_unfold(
        (index, start, false),
        move |(index, cursor, exhausted)| async move {
            if exhausted {
                return Ok::<_, StorageError>(None);
            }
            let page = index.list_page(cursor, page_size).await?;
            let next = page.next_cursor;
            Ok(Some((page.objects, (index, next, next.is_none()))))
        },
    )
    .map_ok(|objects| stream::iter(objects.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

/// SQLite implementation of the metadata index.
#[derive(Clone)]
pub struct SqliteMetadataIndex {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataIndex {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if missing) the database at `database_url`.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// A private in-memory database with the schema applied.
    ///
    /// Pinned to a single connection that never recycles, since every
    /// `:memory:` connection would otherwise see its own empty database.
    pub async fn in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let index = Self::new(Arc::new(pool));
        index.migrate().await?;
        Ok(index)
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn insert(&self, record: &ObjectRecord) -> StorageResult<ObjectRecord> {
        let sql = format!(
            "INSERT INTO objects (id, filename, length, chunk_size, chunk_count, etag, status, upload_date)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING {OBJECT_COLUMNS}"
        );
        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(record.id)
            .bind(&record.filename)
            .bind(record.length)
            .bind(record.chunk_size)
            .bind(record.chunk_count)
            .bind(&record.etag)
            .bind(record.status)
            .bind(record.upload_date)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StorageError::Conflict {
                        id: record.id,
                        reason: "identifier already in use".into(),
                    }
                } else {
                    StorageError::Sqlx(err)
                }
            })
    }

    async fn put(&self, record: &ObjectRecord) -> StorageResult<ObjectRecord> {
        let sql = format!(
            "INSERT INTO objects (id, filename, length, chunk_size, chunk_count, etag, status, upload_date)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                length = excluded.length,
                chunk_size = excluded.chunk_size,
                chunk_count = excluded.chunk_count,
                etag = excluded.etag,
                status = excluded.status,
                upload_date = excluded.upload_date
             RETURNING {OBJECT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(record.id)
            .bind(&record.filename)
            .bind(record.length)
            .bind(record.chunk_size)
            .bind(record.chunk_count)
            .bind(&record.etag)
            .bind(record.status)
            .bind(record.upload_date)
            .fetch_one(&*self.db)
            .await?;
        Ok(row)
    }

    async fn get(&self, id: ObjectId) -> StorageResult<ObjectRecord> {
        let sql = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ? AND status != ?");
        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(id)
            .bind(ObjectStatus::Deleted)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StorageError::NotFound(id),
                other => StorageError::Sqlx(other),
            })
    }

    async fn lookup(&self, id: ObjectId) -> StorageResult<Option<ObjectRecord>> {
        let sql = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?");
        let row = sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row)
    }

    async fn complete(
        &self,
        id: ObjectId,
        length: u64,
        chunk_count: u64,
        etag: &str,
    ) -> StorageResult<ObjectRecord> {
        let sql = format!(
            "UPDATE objects SET status = ?, length = ?, chunk_count = ?, etag = ?
             WHERE id = ? AND status = ?
             RETURNING {OBJECT_COLUMNS}"
        );
        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(ObjectStatus::Complete)
            .bind(length as i64)
            .bind(chunk_count as i64)
            .bind(etag)
            .bind(id)
            .bind(ObjectStatus::Uploading)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StorageError::Conflict {
                id,
                reason: "object is not uploading".into(),
            })
    }

    async fn tombstone(&self, id: ObjectId) -> StorageResult<ObjectRecord> {
        let sql = format!(
            "UPDATE objects SET status = ? WHERE id = ? AND status = ?
             RETURNING {OBJECT_COLUMNS}"
        );
        sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(ObjectStatus::Deleted)
            .bind(id)
            .bind(ObjectStatus::Complete)
            .fetch_optional(&*self.db)
            .await?
            .ok_or(StorageError::NotFound(id))
    }

    async fn remove(&self, id: ObjectId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE id = ? AND status IN (?, ?)")
            .bind(id)
            .bind(ObjectStatus::Uploading)
            .bind(ObjectStatus::Aborted)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_page(&self, after: Option<ListCursor>, limit: usize) -> StorageResult<ListPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let fetch_limit = limit + 1;
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE status != ? AND seq > ?
             ORDER BY seq ASC LIMIT ?"
        );
        let mut rows = sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(ObjectStatus::Deleted)
            .bind(after.map(|c| c.seq()).unwrap_or(0))
            .bind(fetch_limit as i64)
            .fetch_all(&*self.db)
            .await?;

        let mut next_cursor = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_cursor = rows.last().map(|last| ListCursor::after(last.seq));
        }

        Ok(ListPage {
            objects: rows,
            next_cursor,
        })
    }

    async fn stale_uploads(
        &self,
        started_before: DateTime<Utc>,
    ) -> StorageResult<Vec<ObjectRecord>> {
        let sql = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE status = ? ORDER BY seq ASC");
        let rows = sqlx::query_as::<_, ObjectRecord>(&sql)
            .bind(ObjectStatus::Uploading)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows
            .into_iter()
            .filter(|record| record.upload_date < started_before)
            .collect())
    }

    async fn health_check(&self) -> StorageResult<()> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?
        {
            1 => Ok(()),
            other => Err(StorageError::IoFailure(format!(
                "unexpected health query result: {other}"
            ))),
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
