//! Chunk addressing and the fixed-size chunking law.

use crate::models::object::ObjectId;
use bytes::Bytes;
use std::fmt;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: u64 = 1;

/// Largest accepted chunk size (16 MiB).
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Default chunk size (255 KiB), used when neither config nor caller picks one.
pub const DEFAULT_CHUNK_SIZE: u64 = 255 * 1024;

/// One block of an object's payload.
#[derive(Clone)]
pub struct Chunk {
    pub object_id: ObjectId,
    /// 0-based position within the object.
    pub seq: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn new(object_id: ObjectId, seq: u64, data: Bytes) -> Self {
        Self {
            object_id,
            seq,
            data,
        }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("object_id", &self.object_id)
            .field("seq", &self.seq)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Whether `chunk_size` lies within the accepted bounds.
pub fn is_valid_chunk_size(chunk_size: u64) -> bool {
    (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size)
}

/// Number of chunks an object of `length` bytes occupies: `ceil(length / chunk_size)`.
pub fn chunk_count(length: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    length.div_ceil(chunk_size)
}

/// Expected byte length of chunk `seq`, or `None` if `seq` is past the end.
///
/// Every chunk but the last is exactly `chunk_size`; the last holds the
/// remainder (or a full `chunk_size` when `length` divides evenly).
pub fn expected_chunk_len(length: u64, chunk_size: u64, seq: u64) -> Option<u64> {
    let count = chunk_count(length, chunk_size);
    if seq >= count {
        return None;
    }
    if seq + 1 < count {
        Some(chunk_size)
    } else {
        Some(length - chunk_size * (count - 1))
    }
}
