#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use image_titler::error::{InvokeError, StorageError};
use image_titler::inference::{InferenceBackend, ModelOutput};
use image_titler::storage::{ObjectMeta, ObjectStore};
use image_titler::upload::ImageUpload;
use image_titler::{app, AppConfig, AppState};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// What the scripted model does on each call.
#[derive(Clone)]
pub enum Reply {
    Title(&'static str),
    Caption(&'static str, &'static str),
    Fail(InvokeError),
    Stall(Duration),
}

/// In-process model double.
pub struct ScriptedModel {
    reply: Reply,
    pub calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl InferenceBackend for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn infer(&self, _image: &ImageUpload) -> Result<ModelOutput, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.reply {
            Reply::Title(title) => Ok(ModelOutput {
                title: title.to_string(),
                confidence: 0.9,
                explanation: "A scenic view".to_string(),
            }),
            Reply::Caption(title, explanation) => Ok(ModelOutput {
                title: title.to_string(),
                confidence: 0.8,
                explanation: explanation.to_string(),
            }),
            Reply::Fail(err) => Err(err.clone()),
            Reply::Stall(d) => {
                tokio::time::sleep(*d).await;
                Ok(ModelOutput {
                    title: "Too late".to_string(),
                    confidence: 0.5,
                    explanation: String::new(),
                })
            }
        }
    }
}

/// Object store double. Keeps keys in memory or fails every put.
pub struct MemoryStore {
    pub fail: bool,
    pub keys: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            keys: Mutex::new(Vec::new()),
        })
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, _bytes: Bytes, _meta: &ObjectMeta) -> Result<String, StorageError> {
        if self.fail {
            return Err(StorageError::Status { status: 503 });
        }
        self.keys.lock().unwrap().push(key.to_string());
        Ok(key.to_string())
    }
}

pub fn state_with(
    config: &AppConfig,
    model: Arc<ScriptedModel>,
    store: Option<Arc<MemoryStore>>,
) -> AppState {
    let store = store.map(|s| s as Arc<dyn ObjectStore>);
    AppState::new(config, model, store).unwrap()
}

/// Serve the app on an ephemeral port with peer addresses available.
pub async fn spawn(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("http://{}", addr), handle)
}

pub async fn upload(
    client: &reqwest::Client,
    base: &str,
    filename: &str,
    mime: &str,
    bytes: Vec<u8>,
) -> reqwest::Response {
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name(filename.to_string())
        .mime_str(mime)
        .unwrap();
    let form = reqwest::multipart::Form::new().part("file", part);
    client
        .post(format!("{}/analyze-image", base))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

pub async fn metrics(client: &reqwest::Client, base: &str) -> serde_json::Value {
    client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Structurally valid PNG header with optional tEXt chunks.
pub fn png(width: u32, height: u32, text: &[(&str, &str)]) -> Vec<u8> {
    let mut out = b"\x89PNG\r\n\x1a\n".to_vec();
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);
    chunk(&mut out, b"IHDR", &ihdr);
    for (k, v) in text {
        let mut data = k.as_bytes().to_vec();
        data.push(0);
        data.extend_from_slice(v.as_bytes());
        chunk(&mut out, b"tEXt", &data);
    }
    chunk(&mut out, b"IEND", &[]);
    out
}

fn chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(data);
    out.extend_from_slice(&[0, 0, 0, 0]);
}
