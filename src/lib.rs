//! Chunked streaming object store.
//!
//! Objects are split into fixed-size chunks kept in a [`ChunkStore`] and
//! described by one record each in a [`MetadataIndex`]. Uploads and
//! downloads stream chunk by chunk, so memory use is bounded by the chunk
//! size rather than the object size.
//!
//! [`ChunkStore`]: services::chunk_store::ChunkStore
//! [`MetadataIndex`]: services::metadata_index::MetadataIndex

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
