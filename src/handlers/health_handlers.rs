//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata index and chunk storage

use crate::services::storage_service::{StorageResult, StorageService};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against the metadata index (`SELECT 1`).
/// 2. Performs a write/read/delete probe against the chunk store.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let index_check = CheckStatus::from(service.index.health_check().await);
    let chunks_check = CheckStatus::from(service.chunks.health_check().await);

    let overall_ok = index_check.ok && chunks_check.ok;

    let mut checks = HashMap::new();
    checks.insert("metadata_index", index_check);
    checks.insert(service.chunks.backend_name(), chunks_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

impl From<StorageResult<()>> for CheckStatus {
    fn from(result: StorageResult<()>) -> Self {
        match result {
            Ok(()) => Self {
                ok: true,
                error: None,
            },
            Err(err) => Self {
                ok: false,
                error: Some(err.to_string()),
            },
        }
    }
}
