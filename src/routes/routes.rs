//! Defines routes for all object operations.
//!
//! ## Structure
//! - **Collection endpoints**
//!   - `POST   /objects`       - create object from the raw body (`?filename=&chunk_size=`)
//!   - `POST   /objects/form`  - create object from a multipart `file` field
//!   - `GET    /objects`       - list complete objects (`?limit=&continuation-token=`)
//!
//! - **Object endpoints**
//!   - `GET    /objects/{id}`  - download object
//!   - `HEAD   /objects/{id}`  - retrieve metadata only
//!   - `DELETE /objects/{id}`  - tombstone object

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{
            delete_object, get_object, head_object, list_objects, upload_form, upload_object,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build and return the router for all object routes.
///
/// The router carries shared state (`StorageService`) to all handlers.
/// Uploads are streamed chunk by chunk, so request bodies are not size-capped.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Collection routes
        .route("/objects", post(upload_object).get(list_objects))
        .route("/objects/form", post(upload_form))
        // Object routes
        .route(
            "/objects/{id}",
            get(get_object).head(head_object).delete(delete_object),
        )
        .layer(DefaultBodyLimit::disable())
}
