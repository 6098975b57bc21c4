//! Represents a stored object and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Opaque, globally unique object identifier.
///
/// Freshly allocated for every upload and never reused, even after the
/// object has been deleted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Allocate a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ObjectId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for ObjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an object.
///
/// `Uploading -> Complete -> Deleted` and `Uploading -> Aborted`.
/// `Aborted` and `Deleted` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ObjectStatus {
    /// A writer session is open and chunks are being accepted.
    Uploading,
    /// Every chunk is durable and the metadata commit succeeded.
    Complete,
    /// The upload failed or was cancelled; chunks are being reclaimed.
    Aborted,
    /// Tombstoned; invisible to readers, chunks pending purge.
    Deleted,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
            Self::Deleted => "deleted",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: ObjectStatus) -> bool {
        matches!(
            (self, next),
            (Self::Uploading, Self::Complete)
                | (Self::Uploading, Self::Aborted)
                | (Self::Complete, Self::Deleted)
        )
    }

    /// Only complete objects are visible to readers.
    pub fn is_readable(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata record of a stored object.
///
/// The record never holds payload bytes; those live in the chunk store,
/// addressed by `(id, seq)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectRecord {
    /// Insertion sequence assigned by the metadata index. Orders listings.
    pub seq: i64,

    pub id: ObjectId,

    /// Original filename supplied by the uploader.
    pub filename: String,

    /// Total payload length in bytes. Zero until the upload completes.
    pub length: i64,

    /// Chunk size in effect for this upload.
    pub chunk_size: i64,

    /// Number of chunks written. Equals `ceil(length / chunk_size)` once complete.
    pub chunk_count: i64,

    /// Hex-encoded MD5 of the full payload, set on completion.
    pub etag: Option<String>,

    pub status: ObjectStatus,

    /// When the upload session began.
    pub upload_date: DateTime<Utc>,
}

impl ObjectRecord {
    /// A fresh record for an upload session that has just begun.
    pub fn uploading(id: ObjectId, filename: impl Into<String>, chunk_size: u64) -> Self {
        Self {
            seq: 0,
            id,
            filename: filename.into(),
            length: 0,
            chunk_size: chunk_size as i64,
            chunk_count: 0,
            etag: None,
            status: ObjectStatus::Uploading,
            upload_date: Utc::now(),
        }
    }

    pub fn length(&self) -> u64 {
        self.length.max(0) as u64
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size.max(0) as u64
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.max(0) as u64
    }

    /// Public projection returned by listings.
    pub fn summary(&self) -> ObjectSummary {
        ObjectSummary {
            id: self.id,
            filename: self.filename.clone(),
            length: self.length(),
            upload_date: self.upload_date,
        }
    }
}

/// Listing entry exposed to callers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    pub id: ObjectId,
    pub filename: String,
    pub length: u64,
    pub upload_date: DateTime<Utc>,
}
