//! Model invocation.
//!
//! [`Invoker`] wraps an [`InferenceBackend`] with a deadline and timing, and
//! persists successful uploads to the configured [`ObjectStore`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::{InvokeError, StorageError};
use crate::metrics::InvocationRecord;
use crate::storage::{object_key, ObjectMeta, ObjectStore};
use crate::upload::ImageUpload;

pub mod http;

pub use self::http::HttpInferenceBackend;

/// Title generated by the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelOutput {
    pub title: String,
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
}

/// The hosted model endpoint.
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn infer(&self, image: &ImageUpload) -> Result<ModelOutput, InvokeError>;
}

/// Result of one timed call.
#[derive(Debug)]
pub struct Invocation {
    pub record: InvocationRecord,
    pub result: Result<ModelOutput, InvokeError>,
}

#[derive(Clone)]
pub struct Invoker {
    backend: Arc<dyn InferenceBackend>,
    store: Option<Arc<dyn ObjectStore>>,
    timeout: Duration,
    key_seq: Arc<AtomicU64>,
}

impl Invoker {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        store: Option<Arc<dyn ObjectStore>>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            timeout,
            key_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Call the model under the configured deadline. The end time is taken
    /// whatever the outcome.
    pub async fn invoke(&self, upload: &ImageUpload) -> Invocation {
        let started_at = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.backend.infer(upload)).await {
            Ok(Ok(mut output)) => {
                output.confidence = clamp_confidence(output.confidence);
                Ok(output)
            }
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(InvokeError::Timeout(self.timeout)),
        };
        let finished_at = Instant::now();
        if let Err(err) = &result {
            tracing::warn!(
                backend = self.backend.name(),
                kind = err.kind(),
                error = %err,
                elapsed_ms = finished_at.duration_since(started_at).as_millis() as u64,
                "model invocation failed"
            );
        }
        Invocation {
            record: InvocationRecord {
                started_at,
                finished_at,
                succeeded: result.is_ok(),
            },
            result,
        }
    }

    /// Store the original upload. `Ok(None)` when no store is configured.
    pub async fn persist(
        &self,
        upload: &ImageUpload,
        output: &ModelOutput,
        timestamp: i64,
    ) -> Result<Option<String>, StorageError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let seq = self.key_seq.fetch_add(1, Ordering::Relaxed);
        let key = object_key(timestamp, seq, &upload.filename);
        let meta = ObjectMeta {
            content_type: upload.format.mime_type().to_string(),
            title: output.title.clone(),
            confidence: output.confidence,
            timestamp,
        };
        let stored = store.put(&key, upload.bytes.clone(), &meta).await?;
        tracing::debug!(store = store.name(), key = %stored, "artifact stored");
        Ok(Some(stored))
    }
}

/// Accept whatever scalar the model sends: numbers, numeric strings, or
/// null. Anything unreadable becomes 0 and is clamped later.
fn lenient_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    })
}

/// Clamp a model supplied confidence into [0, 1]. Non-finite values become 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::fixtures;
    use axum::body::Bytes;

    struct Scripted {
        delay: Duration,
        reply: Result<ModelOutput, InvokeError>,
    }

    #[async_trait::async_trait]
    impl InferenceBackend for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn infer(&self, _image: &ImageUpload) -> Result<ModelOutput, InvokeError> {
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    fn upload() -> ImageUpload {
        ImageUpload::validate(
            Some("a.png"),
            Some("image/png"),
            Bytes::from(fixtures::png(4, 4, &[])),
        )
        .unwrap()
    }

    fn output(confidence: f64) -> ModelOutput {
        ModelOutput {
            title: "Morning Fog".into(),
            confidence,
            explanation: "fog over water".into(),
        }
    }

    #[test]
    fn clamps_confidence() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[test]
    fn confidence_accepts_loose_scalars() {
        let parse = |v: serde_json::Value| serde_json::from_value::<ModelOutput>(v).unwrap();
        let null = parse(serde_json::json!({"title": "Fog", "confidence": null}));
        assert_eq!(null.confidence, 0.0);
        let text = parse(serde_json::json!({"title": "Fog", "confidence": " 0.75 "}));
        assert_eq!(text.confidence, 0.75);
        let junk = parse(serde_json::json!({"title": "Fog", "confidence": "high"}));
        assert_eq!(junk.confidence, 0.0);
        let missing = parse(serde_json::json!({"title": "Fog"}));
        assert_eq!(missing.confidence, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_classified_as_timeout() {
        let invoker = Invoker::new(
            Arc::new(Scripted {
                delay: Duration::from_secs(60),
                reply: Ok(output(0.9)),
            }),
            None,
            Duration::from_secs(30),
        );
        let inv = invoker.invoke(&upload()).await;
        assert_eq!(inv.result, Err(InvokeError::Timeout(Duration::from_secs(30))));
        assert!(!inv.record.succeeded);
    }

    #[tokio::test]
    async fn success_clamps_and_times_call() {
        let invoker = Invoker::new(
            Arc::new(Scripted {
                delay: Duration::from_millis(5),
                reply: Ok(output(3.0)),
            }),
            None,
            Duration::from_secs(5),
        );
        let inv = invoker.invoke(&upload()).await;
        assert_eq!(inv.result.unwrap().confidence, 1.0);
        assert!(inv.record.succeeded);
        assert!(inv.record.duration() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn persist_without_store_yields_no_key() {
        let invoker = Invoker::new(
            Arc::new(Scripted {
                delay: Duration::ZERO,
                reply: Ok(output(0.5)),
            }),
            None,
            Duration::from_secs(1),
        );
        let key = invoker.persist(&upload(), &output(0.5), 10).await.unwrap();
        assert!(key.is_none());
    }
}
