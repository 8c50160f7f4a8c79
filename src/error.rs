//! Error taxonomy for the titling pipeline and its translation into the
//! `{detail}` responses the dashboard expects.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failure of a single model invocation, classified at the invoker boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    /// Transport failure, upstream 5xx/429 or an unreadable model reply.
    #[error("model service unavailable: {0}")]
    UpstreamUnavailable(String),
    /// The model (or its provider) declined the request.
    #[error("model declined the request: {0}")]
    UpstreamRejected(String),
    #[error("model call exceeded {}ms deadline", .0.as_millis())]
    Timeout(Duration),
}

impl InvokeError {
    /// Short identifier used in telemetry events and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::UpstreamUnavailable(_) => "upstream_unavailable",
            InvokeError::UpstreamRejected(_) => "upstream_rejected",
            InvokeError::Timeout(_) => "timeout",
        }
    }
}

/// Object store failure. Never surfaced to the caller: storage is best effort.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage request failed: {0}")]
    Transport(String),
    #[error("storage rejected object (status {status})")]
    Status { status: u16 },
}

/// Terminal error of an `/analyze-image` request.
#[derive(Debug, Error)]
pub enum TitleError {
    #[error("Rate limit exceeded. Please try again in {retry_after_secs} seconds.")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    UnsupportedFormat(String),
    #[error("{0}")]
    ContentRejected(String),
    #[error("Missing multipart field 'file'")]
    MissingFile,
    #[error("Malformed upload: {0}")]
    MalformedUpload(String),
    #[error("Upload exceeds the request size limit")]
    PayloadTooLarge,
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl TitleError {
    pub fn status(&self) -> StatusCode {
        match self {
            TitleError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            TitleError::UnsupportedFormat(_)
            | TitleError::ContentRejected(_)
            | TitleError::MissingFile
            | TitleError::MalformedUpload(_) => StatusCode::BAD_REQUEST,
            TitleError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            TitleError::Invoke(InvokeError::UpstreamRejected(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            TitleError::Invoke(InvokeError::UpstreamUnavailable(_)) => StatusCode::BAD_GATEWAY,
            TitleError::Invoke(InvokeError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            TitleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short identifier used in telemetry events.
    pub fn kind(&self) -> &'static str {
        match self {
            TitleError::RateLimited { .. } => "rate_limited",
            TitleError::UnsupportedFormat(_) => "unsupported_format",
            TitleError::ContentRejected(_) => "content_rejected",
            TitleError::MissingFile => "missing_file",
            TitleError::MalformedUpload(_) => "malformed_upload",
            TitleError::PayloadTooLarge => "payload_too_large",
            TitleError::Invoke(inner) => inner.kind(),
            TitleError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for TitleError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
