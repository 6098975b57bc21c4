//! Integration tests for HTTP API endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{TestStore, payload};
use serde_json::Value;
use tower::ServiceExt;

/// Send a request and return status, headers and raw body.
async fn send(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Body,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body_bytes.to_vec())
}

fn json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or(Value::Null)
}

async fn create(router: &axum::Router, uri: &str, data: Vec<u8>) -> String {
    let (status, _, body) = send(router, "POST", uri, Body::from(data)).await;
    assert_eq!(status, StatusCode::CREATED);
    json(&body)["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_unreadable_first_chunk_is_server_error() {
    let store = TestStore::new(4).await;
    let router = store.router();
    let id = create(&router, "/objects", payload(10)).await;
    store.chunks.hide_chunk(id.parse().unwrap(), 0);

    let (status, headers, body) = send(&router, "GET", &format!("/objects/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(headers.get(header::ETAG).is_none());
    assert_eq!(json(&body)["status"], 500);
}

#[tokio::test]
async fn test_health_endpoints() {
    let store = TestStore::new(4).await;
    let router = store.router();

    let (status, _, body) = send(&router, "GET", "/healthz", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["status"], "ok");

    let (status, _, body) = send(&router, "GET", "/readyz", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["checks"]["metadata_index"]["ok"], true);
}

#[tokio::test]
async fn test_upload_then_download() {
    let store = TestStore::new(1024).await;
    let router = store.router();
    let data = payload(5_000);

    let id = create(&router, "/objects?filename=report.pdf&chunk_size=512", data.clone()).await;

    let (status, headers, body) = send(&router, "GET", &format!("/objects/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);
    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
        "5000"
    );
    assert_eq!(
        headers.get(header::ETAG).unwrap().to_str().unwrap(),
        format!("\"{:x}\"", md5::compute(&data))
    );
    assert_eq!(
        headers
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap(),
        "attachment; filename=\"report.pdf\""
    );
}

#[tokio::test]
async fn test_head_returns_headers_only() {
    let store = TestStore::new(4).await;
    let router = store.router();
    let id = create(&router, "/objects", b"hello world".to_vec()).await;

    let (status, headers, body) = send(&router, "HEAD", &format!("/objects/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(
        headers.get(header::CONTENT_LENGTH).unwrap().to_str().unwrap(),
        "11"
    );
}

#[tokio::test]
async fn test_invalid_id_is_bad_request() {
    let store = TestStore::new(4).await;
    let router = store.router();

    let (status, _, body) = send(&router, "GET", "/objects/not-a-uuid", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json(&body)["status"], 400);
}

#[tokio::test]
async fn test_invalid_chunk_size_is_bad_request() {
    let store = TestStore::new(4).await;
    let router = store.router();

    let (status, _, _) = send(&router, "POST", "/objects?chunk_size=0", Body::from("abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_object_is_not_found() {
    let store = TestStore::new(4).await;
    let router = store.router();
    let id = uuid::Uuid::new_v4();

    for method in ["GET", "HEAD", "DELETE"] {
        let (status, _, _) = send(&router, method, &format!("/objects/{id}"), Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method}");
    }
}

#[tokio::test]
async fn test_delete_hides_object() {
    let store = TestStore::new(4).await;
    let router = store.router();
    let id = create(&router, "/objects", b"short-lived".to_vec()).await;

    let (status, _, body) = send(&router, "DELETE", &format!("/objects/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)["deleted"], true);

    let (status, _, _) = send(&router, "GET", &format!("/objects/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = send(&router, "GET", "/objects", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body), Value::Array(vec![]));
}

#[tokio::test]
async fn test_list_objects_json_shape() {
    let store = TestStore::new(4).await;
    let router = store.router();
    let id = create(&router, "/objects?filename=a.txt", b"abcdef".to_vec()).await;

    let (status, _, body) = send(&router, "GET", "/objects", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);

    let list = json(&body);
    let entries = list.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], id.as_str());
    assert_eq!(entries[0]["filename"], "a.txt");
    assert_eq!(entries[0]["length"], 6);
    assert!(entries[0]["uploadDate"].is_string());
}

#[tokio::test]
async fn test_list_objects_paginates_with_header() {
    let store = TestStore::new(4).await;
    let router = store.router();
    for n in 0..3 {
        create(&router, &format!("/objects?filename=f{n}"), b"data".to_vec()).await;
    }

    let (status, headers, body) = send(&router, "GET", "/objects?limit=2", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body).as_array().unwrap().len(), 2);
    let token = headers
        .get("x-next-continuation-token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let uri = format!("/objects?limit=2&continuation-token={token}");
    let (status, headers, body) = send(&router, "GET", &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json(&body)[0]["filename"], "f2");
    assert!(headers.get("x-next-continuation-token").is_none());

    let (status, _, _) = send(&router, "GET", "/objects?limit=0", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = send(&router, "GET", "/objects?continuation-token=%21%21", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_multipart_upload() {
    let store = TestStore::new(4).await;
    let router = store.router();

    let boundary = "X-CHUNK-STORE-BOUNDARY";
    let form = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         multipart payload\r\n\
         --{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/objects/form")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(form))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let id = json(&body)["id"].as_str().unwrap().to_string();

    let (status, headers, body) = send(&router, "GET", &format!("/objects/{id}"), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"multipart payload");
    assert!(
        headers
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("notes.txt")
    );
}
