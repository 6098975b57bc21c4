//! Core data models for the chunk store.
//!
//! An object is one metadata record plus an ordered run of chunks. Records
//! map to the `objects` table via `sqlx::FromRow` and serialize as JSON
//! via `serde`.

pub mod chunk;
pub mod object;
