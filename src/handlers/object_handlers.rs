//! HTTP handlers for object operations.
//! Streams object bodies in both directions so payloads are never buffered
//! whole, and delegates storage concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::object::{ObjectId, ObjectRecord, ObjectSummary},
    services::{
        metadata_index::MAX_PAGE_SIZE,
        storage_service::{ListObjectsParams, StorageService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use std::io;

/// Header carrying the token for the next listing page.
pub const NEXT_CONTINUATION_TOKEN: HeaderName =
    HeaderName::from_static("x-next-continuation-token");

/// Query params accepted when creating an object.
#[derive(Debug, Default, Deserialize)]
pub struct CreateObjectQuery {
    pub filename: Option<String>,
    pub chunk_size: Option<u64>,
}

/// Query params accepted by the listing.
#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    pub limit: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: ObjectId,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub id: ObjectId,
    pub deleted: bool,
}

/// `POST /objects`: create an object from the raw request body.
pub async fn upload_object(
    State(service): State<StorageService>,
    Query(q): Query<CreateObjectQuery>,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    let object = service
        .upload_object_stream(q.filename, q.chunk_size, stream)
        .await?;

    Ok((StatusCode::CREATED, Json(CreatedResponse { id: object.id })))
}

/// `POST /objects/form`: create an object from the `file` field of a
/// multipart form.
pub async fn upload_form(
    State(service): State<StorageService>,
    Query(q): Query<CreateObjectQuery>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .or_else(|| q.filename.clone());
        let stream = field.map(|chunk| chunk.map_err(io::Error::other));

        let object = service
            .upload_object_stream(filename, q.chunk_size, stream)
            .await?;
        return Ok((StatusCode::CREATED, Json(CreatedResponse { id: object.id })));
    }

    Err(AppError::bad_request("multipart body has no `file` field"))
}

/// `GET /objects/{id}`: stream the object's bytes.
///
/// The first chunk is read before any header is sent, so an object that is
/// already unreadable gets a plain error status. A failure after that aborts
/// the body, and the client sees a short read against `Content-Length`
/// rather than a clean end of stream.
pub async fn get_object(
    State(service): State<StorageService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = StorageService::parse_id(&id)?;
    let mut download = service.get_object_reader(id).await?;
    let meta = download.record().clone();
    let first = download.next_chunk().await?;

    let stream = stream::iter(first.map(Ok))
        .chain(download.into_stream())
        .inspect_err(move |err| {
            tracing::warn!(object_id = %id, "download aborted mid-stream: {}", err);
        });
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    set_content_disposition(response.headers_mut(), &meta);

    Ok(response)
}

/// `HEAD /objects/{id}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = StorageService::parse_id(&id)?;
    let meta = service.get_object_metadata(id).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// `DELETE /objects/{id}`: tombstone the object; chunks are purged in the background.
pub async fn delete_object(
    State(service): State<StorageService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = StorageService::parse_id(&id)?;
    let receipt = service.delete_object(id).await?;

    Ok((
        StatusCode::OK,
        Json(DeletedResponse {
            id: receipt.record.id,
            deleted: true,
        }),
    ))
}

/// `GET /objects`: JSON array of complete objects in upload order.
///
/// Without `limit` every object is returned. With `limit` one page is
/// returned and, if more remain, the token for the next one is sent in
/// `x-next-continuation-token`.
pub async fn list_objects(
    State(service): State<StorageService>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Response, AppError> {
    if q.limit.is_none() && q.continuation_token.is_none() {
        let objects: Vec<ObjectSummary> = service
            .list_all()
            .map_ok(|record| record.summary())
            .try_collect()
            .await?;
        return Ok(Json(objects).into_response());
    }

    let limit = q.limit.unwrap_or(MAX_PAGE_SIZE);
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    let result = service
        .list_objects(ListObjectsParams {
            continuation_token: q.continuation_token,
            max_keys: limit,
        })
        .await?;

    let objects: Vec<ObjectSummary> = result.objects.iter().map(ObjectRecord::summary).collect();
    let mut response = Json(objects).into_response();
    if let Some(token) = result.next_continuation_token {
        if let Ok(value) = HeaderValue::from_str(&token) {
            response.headers_mut().insert(NEXT_CONTINUATION_TOKEN, value);
        }
    }
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.length()));

    if let Some(etag) = meta.etag.as_ref() {
        let quoted = format!("\"{}\"", etag);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.upload_date.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

fn set_content_disposition(headers: &mut HeaderMap, meta: &ObjectRecord) {
    let filename: String = meta
        .filename
        .chars()
        .filter(|c| (c.is_ascii_graphic() && *c != '"' && *c != '\\') || *c == ' ')
        .collect();
    let filename = if filename.trim().is_empty() {
        meta.id.to_string()
    } else {
        filename
    };
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
