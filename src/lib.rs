//! Core library for the image titler.  This module wires together the
//! admission controls, the model invoker and the analytics aggregator, and
//! exposes the HTTP handlers.
//!
//! A title request moves through these stages:
//! `Received → RateChecked → SafetyPreChecked → Invoked → SafetyPostChecked
//! → Recorded → Responded`. Rate limit, format and input safety rejections
//! respond early without touching the invocation metrics. Once the model
//! has been called, the outcome is always recorded, including when the
//! output gate rejects the generated title.

mod config;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod rate_limit;
pub mod safety;
pub mod storage;
pub mod telemetry;
pub mod upload;

pub use config::{AppConfig, ModelConfig, RateLimitConfig, RotationConfig, StorageConfig};
pub use error::{InvokeError, StorageError, TitleError};
pub use metrics::{MetricsAggregator, MetricsSnapshot, Outcome};

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::inference::{HttpInferenceBackend, InferenceBackend, Invocation, Invoker};
use crate::metrics::{RecordGuard, ServiceCounters};
use crate::rate_limit::RateLimiter;
use crate::safety::{SafetyGate, Verdict};
use crate::storage::{HttpObjectStore, LocalObjectStore, ObjectStore};
use crate::telemetry::{InvocationEvent, RotatingWriter, TelemetrySink};
use crate::upload::ImageUpload;

const SERVICE_NAME: &str = "Automatic Image Titling API";

/// Successful `/analyze-image` response.
#[derive(Debug, Clone, Serialize)]
pub struct TitleResult {
    pub title: String,
    pub confidence: f64,
    pub explanation: String,
    /// Model call duration in seconds.
    pub processing_time: f64,
    /// Unix seconds.
    pub timestamp: i64,
    pub s3_key: Option<String>,
}

/// Last stage a request reached, reported in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    RateChecked,
    SafetyPreChecked,
    Invoked,
    SafetyPostChecked,
    Recorded,
    Responded,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::RateChecked => "rate_checked",
            Stage::SafetyPreChecked => "safety_pre_checked",
            Stage::Invoked => "invoked",
            Stage::SafetyPostChecked => "safety_post_checked",
            Stage::Recorded => "recorded",
            Stage::Responded => "responded",
        };
        f.write_str(s)
    }
}

/// Application state shared across handlers. Every piece of mutable state
/// is owned here so tests can build a fresh instance per case.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub gate: SafetyGate,
    pub invoker: Invoker,
    pub metrics: Arc<MetricsAggregator>,
    pub counters: Arc<ServiceCounters>,
    pub telemetry: TelemetrySink,
    pub trust_forwarded: bool,
    pub max_request_bytes: usize,
    pub sweep_every: Option<Duration>,
}

impl AppState {
    /// Assemble state from configuration and the two external collaborators.
    pub fn new(
        config: &AppConfig,
        backend: Arc<dyn InferenceBackend>,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> anyhow::Result<Self> {
        let gate = SafetyGate::new(&config.safety_classifiers, &config.safety)
            .context("failed to build safety gate")?;
        if gate.is_empty() {
            tracing::warn!("no safety classifiers configured; uploads and titles are not screened");
        }
        if store.is_none() {
            tracing::warn!("object storage disabled; responses will carry s3_key=null");
        }
        let writer = match config.log_file.as_deref() {
            Some(path) => match RotatingWriter::open(path, config.rotation.clone()) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to open LOG_FILE; event log disabled");
                    None
                }
            },
            None => None,
        };
        Ok(Self {
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit.max_requests,
                config.rate_limit.window,
            )),
            gate,
            invoker: Invoker::new(backend, store, config.model.timeout),
            metrics: Arc::new(MetricsAggregator::new(config.metrics_history)),
            counters: Arc::new(ServiceCounters::new()),
            telemetry: TelemetrySink::new(writer, config.log_stdout),
            trust_forwarded: config.rate_limit.trust_forwarded,
            max_request_bytes: config.max_request_bytes,
            sweep_every: config.rate_limit.sweep_every,
        })
    }

    /// Start the stale rate-limit window sweep, when enabled.
    pub fn spawn_background_tasks(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.sweep_every
            .map(|every| self.limiter.spawn_sweeper(every))
    }

    fn emit_event(
        &self,
        client_id: &str,
        stage: Stage,
        received_at: Instant,
        error: Option<&TitleError>,
        s3_key: Option<&str>,
    ) {
        let outcome = match (error, stage) {
            (None, _) => "success",
            (Some(_), Stage::Recorded) => "failure",
            (Some(_), _) => "rejected",
        };
        let stage = stage.to_string();
        self.telemetry.emit(&InvocationEvent {
            schema_version: 1,
            ts: chrono::Utc::now().to_rfc3339(),
            client_id,
            stage: &stage,
            outcome,
            error_kind: error.map(TitleError::kind),
            latency_ms: received_at.elapsed().as_millis(),
            s3_key,
        });
    }

    /// Reject early, before the model is involved. Metrics are untouched.
    fn reject(
        &self,
        client_id: &str,
        stage: Stage,
        received_at: Instant,
        err: TitleError,
    ) -> TitleError {
        tracing::info!(client = %client_id, %stage, kind = err.kind(), detail = %err, "request rejected");
        self.emit_event(client_id, stage, received_at, Some(&err), None);
        err
    }

    /// Everything from the model call onwards. Runs in its own task so the
    /// outcome is recorded even if the caller goes away.
    async fn invoke_and_record(
        self,
        client_id: String,
        upload: ImageUpload,
        received_at: Instant,
    ) -> Result<TitleResult, TitleError> {
        let pending = RecordGuard::new(Arc::clone(&self.metrics));
        let Invocation { record, result } = self.invoker.invoke(&upload).await;
        self.counters.observe_latency(record.duration());
        tracing::debug!(client = %client_id, stage = %Stage::Invoked, ok = record.succeeded);

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let counter = match err {
                    InvokeError::UpstreamUnavailable(_) => &self.counters.upstream_unavailable_total,
                    InvokeError::UpstreamRejected(_) => &self.counters.upstream_rejected_total,
                    InvokeError::Timeout(_) => &self.counters.timeouts_total,
                };
                ServiceCounters::incr(counter);
                pending.complete(record.outcome());
                let err = TitleError::from(err);
                self.emit_event(&client_id, Stage::Recorded, received_at, Some(&err), None);
                return Err(err);
            }
        };

        let verdict = match self.gate.check_output(&output.title).await {
            Verdict::Allowed => self.gate.check_output(&output.explanation).await,
            rejected => rejected,
        };
        tracing::debug!(client = %client_id, stage = %Stage::SafetyPostChecked, allowed = verdict.is_allowed());
        if let Verdict::Rejected(reason) = verdict {
            ServiceCounters::incr(&self.counters.output_rejected_total);
            pending.complete(record.into_failure().outcome());
            let err = TitleError::ContentRejected(reason);
            tracing::info!(client = %client_id, detail = %err, "generated title rejected");
            self.emit_event(&client_id, Stage::Recorded, received_at, Some(&err), None);
            return Err(err);
        }
        pending.complete(record.outcome());

        let timestamp = chrono::Utc::now().timestamp();
        let s3_key = match self.invoker.persist(&upload, &output, timestamp).await {
            Ok(key) => key,
            Err(e) => {
                ServiceCounters::incr(&self.counters.storage_failures_total);
                tracing::warn!(client = %client_id, error = %e, "failed to store upload; returning title without s3_key");
                None
            }
        };

        self.emit_event(
            &client_id,
            Stage::Responded,
            received_at,
            None,
            s3_key.as_deref(),
        );
        Ok(TitleResult {
            title: output.title,
            confidence: output.confidence,
            explanation: output.explanation,
            processing_time: record.duration().as_secs_f64(),
            timestamp,
            s3_key,
        })
    }
}

/// Build state from environment variables. See [`AppConfig::from_env`]
/// for the variables read. `TITLER_MODEL_URL` is required.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    let url = config
        .model
        .url
        .as_deref()
        .context("TITLER_MODEL_URL must be set to the inference endpoint")?;
    let backend = HttpInferenceBackend::new(
        url,
        config.model.token.clone(),
        &config.model.model_id,
        config.model.timeout,
    )
    .context("failed to build inference client")?;
    let store: Option<Arc<dyn ObjectStore>> = match &config.storage {
        StorageConfig::Disabled => None,
        StorageConfig::Local { dir } => Some(Arc::new(LocalObjectStore::new(dir))),
        StorageConfig::Http { url, token } => Some(Arc::new(
            HttpObjectStore::new(url, token.clone(), config.model.timeout)
                .context("failed to build storage client")?,
        )),
    };
    AppState::new(&config, Arc::new(backend), store)
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .route("/analyze-image", post(analyze_image_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        // Enforced while the multipart stream is read, so an oversized
        // upload surfaces as a `{detail}` 413 after the rate check.
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Client identifier for rate limiting: the peer address, or the first
/// `x-forwarded-for` hop when the deployment sits behind a trusted proxy.
fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(hop) = forwarded {
            return hop.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn read_upload(mut multipart: Multipart) -> Result<ImageUpload, TitleError> {
    let framing = |e: axum::extract::multipart::MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            TitleError::PayloadTooLarge
        } else {
            TitleError::MalformedUpload(e.body_text())
        }
    };
    while let Some(field) = multipart.next_field().await.map_err(framing)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_owned);
        let content_type = field.content_type().map(str::to_owned);
        let bytes = field.bytes().await.map_err(framing)?;
        return ImageUpload::validate(filename.as_deref(), content_type.as_deref(), bytes);
    }
    Err(TitleError::MissingFile)
}

/// Handler for `POST /analyze-image`.
async fn analyze_image_handler(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<TitleResult>, TitleError> {
    let received_at = Instant::now();
    ServiceCounters::incr(&state.counters.requests_total);
    let client = client_id(&headers, peer.map(|ConnectInfo(addr)| addr), state.trust_forwarded);

    if let Err(retry_after) = state.limiter.try_admit(&client) {
        ServiceCounters::incr(&state.counters.rate_limited_total);
        let err = TitleError::RateLimited {
            retry_after_secs: (retry_after.as_secs_f64().ceil() as u64).max(1),
        };
        return Err(state.reject(&client, Stage::RateChecked, received_at, err));
    }
    tracing::debug!(client = %client, stage = %Stage::RateChecked);

    let upload = match multipart {
        Ok(multipart) => read_upload(multipart).await,
        Err(rejection) => Err(TitleError::MalformedUpload(rejection.body_text())),
    };
    let upload = match upload {
        Ok(upload) => upload,
        Err(err) => {
            ServiceCounters::incr(&state.counters.invalid_uploads_total);
            return Err(state.reject(&client, Stage::RateChecked, received_at, err));
        }
    };

    if let Verdict::Rejected(reason) = state.gate.check_input(&upload).await {
        ServiceCounters::incr(&state.counters.input_rejected_total);
        let err = TitleError::ContentRejected(reason);
        return Err(state.reject(&client, Stage::SafetyPreChecked, received_at, err));
    }
    tracing::debug!(client = %client, stage = %Stage::SafetyPreChecked, bytes = upload.len());

    let task = tokio::spawn(state.clone().invoke_and_record(client, upload, received_at));
    match task.await {
        Ok(result) => result.map(Json),
        Err(join_err) => {
            tracing::error!(error = %join_err, "invocation task failed");
            Err(TitleError::Internal("invocation task failed".into()))
        }
    }
}

async fn root_handler() -> axum::response::Response {
    let json = serde_json::json!({ "message": format!("{} is running", SERVICE_NAME) });
    (StatusCode::OK, Json(json)).into_response()
}

/// Liveness probe.
async fn health_handler() -> axum::response::Response {
    let json = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Dashboard analytics.
async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Prometheus-style exposition of the service counters.
async fn prometheus_handler(State(state): State<AppState>) -> axum::response::Response {
    let body = state
        .counters
        .render_prometheus(&state.metrics.snapshot(), &state.telemetry);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}
