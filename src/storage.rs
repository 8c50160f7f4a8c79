//! Object store collaborators for uploaded artifacts.
//!
//! Storage is best effort: callers log a [`StorageError`] and carry on
//! without a key.

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::error::StorageError;

/// Metadata stored alongside an artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectMeta {
    pub content_type: String,
    pub title: String,
    pub confidence: f64,
    pub timestamp: i64,
}

#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    fn name(&self) -> &str;
    /// Store `bytes` under `key` and return the key the object is reachable by.
    async fn put(&self, key: &str, bytes: Bytes, meta: &ObjectMeta) -> Result<String, StorageError>;
}

static UNSAFE_KEY_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

/// Build the object key for an upload. The file name is reduced to a safe
/// character set so keys never contain path separators.
pub fn object_key(timestamp: i64, seq: u64, filename: &str) -> String {
    let cleaned = UNSAFE_KEY_CHARS.replace_all(filename, "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    let name = if cleaned.is_empty() { "upload" } else { cleaned };
    format!("images/{}_{}_{}", timestamp, seq, name)
}

/// Writes artifacts below a root directory with a JSON metadata sidecar.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn put(&self, key: &str, bytes: Bytes, meta: &ObjectMeta) -> Result<String, StorageError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        let sidecar = serde_json::to_vec(meta).map_err(std::io::Error::from)?;
        let mut sidecar_path = path.into_os_string();
        sidecar_path.push(".meta.json");
        tokio::fs::write(PathBuf::from(sidecar_path), sidecar).await?;
        Ok(key.to_string())
    }
}

/// PUTs artifacts to `{base_url}/{key}`, S3 style, with metadata carried in
/// `x-amz-meta-*` headers.
pub struct HttpObjectStore {
    base_url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(
        base_url: &str,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
            client,
        })
    }
}

#[async_trait::async_trait]
impl ObjectStore for HttpObjectStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn put(&self, key: &str, bytes: Bytes, meta: &ObjectMeta) -> Result<String, StorageError> {
        let url = format!("{}/{}", self.base_url, key);
        // header values must be visible ASCII
        let title: String = meta
            .title
            .chars()
            .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
            .collect();
        let mut rb = self
            .client
            .put(&url)
            .header("content-type", &meta.content_type)
            .header("x-amz-meta-title", title)
            .header("x-amz-meta-confidence", meta.confidence.to_string())
            .header("x-amz-meta-timestamp", meta.timestamp.to_string());
        if let Some(tok) = &self.bearer_token {
            rb = rb.bearer_auth(tok);
        }
        let resp = rb
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StorageError::Status {
                status: resp.status().as_u16(),
            });
        }
        Ok(key.to_string())
    }
}
