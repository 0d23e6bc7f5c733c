//! Object storage for collage sources and finished collages.
//!
//! [`HttpAssetStore`] talks to an unsigned-upload endpoint: a multipart POST
//! carrying the file and an upload preset, answered with a JSON body holding
//! the durable URL. [`MemoryAssetStore`] keeps everything in process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::{Result, StoreError};

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Store `bytes` and return the URL they can be fetched from.
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> Result<String>;

    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

// ── HttpAssetStore ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct UploadResponse {
    secure_url: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpAssetStore {
    client: Client,
    upload_url: String,
    upload_preset: String,
}

impl HttpAssetStore {
    pub fn new(client: Client, upload_url: impl Into<String>, upload_preset: impl Into<String>) -> Self {
        Self {
            client,
            upload_url: upload_url.into(),
            upload_preset: upload_preset.into(),
        }
    }
}

#[async_trait]
impl AssetStore for HttpAssetStore {
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> Result<String> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("image/png")
            .map_err(|e| StoreError::UploadFailed(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("upload_preset", self.upload_preset.clone());

        let resp = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StoreError::UploadFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("Upload rejected with {status}: {body}");
            return Err(StoreError::UploadFailed(format!("upload endpoint returned {status}")));
        }

        let body: UploadResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::UploadFailed(e.to_string()))?;
        let url = body
            .secure_url
            .or(body.url)
            .ok_or_else(|| StoreError::UploadFailed("response carried no URL".to_string()))?;
        debug!("Uploaded {file_name} → {url}");
        Ok(url)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

// ── MemoryAssetStore ──────────────────────────────────────────────

pub const MEMORY_SCHEME: &str = "memory://";

#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    next_id: AtomicU64,
    reject_uploads: AtomicBool,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object under an explicit URL.
    pub async fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().await.insert(url.into(), bytes);
    }

    /// Make every following upload fail, as an unavailable endpoint would.
    pub fn set_reject_uploads(&self, reject: bool) {
        self.reject_uploads.store(reject, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn upload(&self, bytes: Vec<u8>, file_name: &str) -> Result<String> {
        if self.reject_uploads.load(Ordering::SeqCst) {
            return Err(StoreError::UploadFailed(
                "upload endpoint returned 503 Service Unavailable".to_string(),
            ));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let url = format!("{MEMORY_SCHEME}uploads/{id}/{file_name}");
        self.objects.write().await.insert(url.clone(), bytes);
        Ok(url)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("asset {url}")))
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryAssetStore::new();
        let url = store.upload(vec![1, 2, 3], "a.png").await.unwrap();
        assert!(url.starts_with(MEMORY_SCHEME));
        assert!(url.ends_with("a.png"));
        assert_eq!(store.fetch(&url).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn memory_store_rejects_when_asked() {
        let store = MemoryAssetStore::new();
        store.set_reject_uploads(true);
        assert!(matches!(
            store.upload(vec![0], "a.png").await,
            Err(StoreError::UploadFailed(_))
        ));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn memory_store_missing_is_not_found() {
        let store = MemoryAssetStore::new();
        assert!(matches!(
            store.fetch("memory://nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    /// Local stand-in for the upload endpoint that answers every well-formed
    /// upload with `reply`, and serves `/files/x.png`.
    async fn stub_endpoint(reply: (StatusCode, Value)) -> String {
        let app = Router::new()
            .route(
                "/upload",
                post(move |body: Bytes| {
                    let reply = reply.clone();
                    async move {
                        let text = String::from_utf8_lossy(&body);
                        if !text.contains("name=\"file\"")
                            || !text.contains("name=\"upload_preset\"")
                            || !text.contains("collages")
                        {
                            return (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed"})));
                        }
                        (reply.0, Json(reply.1))
                    }
                }),
            )
            .route("/files/x.png", get(|| async { vec![7u8, 8, 9] }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn http_store(base: &str) -> HttpAssetStore {
        HttpAssetStore::new(Client::new(), format!("{base}/upload"), "collages")
    }

    #[tokio::test]
    async fn http_upload_prefers_secure_url() {
        let base = stub_endpoint((
            StatusCode::OK,
            json!({"secure_url": "https://cdn/x.png", "url": "http://cdn/x.png", "bytes": 10}),
        ))
        .await;
        let url = http_store(&base).upload(vec![1, 2, 3], "a.png").await.unwrap();
        assert_eq!(url, "https://cdn/x.png");
    }

    #[tokio::test]
    async fn http_upload_falls_back_to_plain_url() {
        let base = stub_endpoint((StatusCode::OK, json!({"url": "http://cdn/y.png"}))).await;
        let url = http_store(&base).upload(vec![1], "b.png").await.unwrap();
        assert_eq!(url, "http://cdn/y.png");
    }

    #[tokio::test]
    async fn http_upload_non_ok_is_upload_failed() {
        let base = stub_endpoint((
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "try later"}),
        ))
        .await;
        let err = http_store(&base).upload(vec![1], "c.png").await.unwrap_err();
        assert!(matches!(err, StoreError::UploadFailed(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn http_upload_without_url_is_upload_failed() {
        let base = stub_endpoint((StatusCode::OK, json!({"bytes": 10}))).await;
        assert!(matches!(
            http_store(&base).upload(vec![1], "d.png").await,
            Err(StoreError::UploadFailed(_))
        ));
    }

    #[tokio::test]
    async fn http_fetch_reads_body_and_rejects_missing() {
        let base = stub_endpoint((StatusCode::OK, json!({}))).await;
        let store = http_store(&base);
        assert_eq!(
            store.fetch(&format!("{base}/files/x.png")).await.unwrap(),
            vec![7, 8, 9]
        );
        assert!(matches!(
            store.fetch(&format!("{base}/files/missing.png")).await,
            Err(StoreError::Http(_))
        ));
    }
}
