//! Core store: collaborators, upload/download pipelines, deletion and GC.

pub mod chunk_store;
pub mod gc;
pub mod metadata_index;
pub mod reader;
pub mod storage_service;
pub mod writer;
