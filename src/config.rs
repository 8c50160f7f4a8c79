use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::inference::http::DEFAULT_MODEL_ID;
use crate::metrics::DEFAULT_HISTORY_CAPACITY;
use crate::safety::{parse_classifier_order, SafetyConfig};

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    /// Interval of the stale client sweep; `None` disables it.
    pub sweep_every: Option<Duration>,
    /// Take the client id from `x-forwarded-for` when present.
    pub trust_forwarded: bool,
}

#[derive(Debug, Clone)]
pub enum StorageConfig {
    Disabled,
    Local { dir: String },
    Http { url: String, token: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub model_id: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rate_limit: RateLimitConfig,
    pub safety: SafetyConfig,
    pub safety_classifiers: Vec<String>,
    pub model: ModelConfig,
    pub storage: StorageConfig,
    pub metrics_history: usize,
    pub max_request_bytes: usize,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig {
                max_requests: 5,
                window: Duration::from_secs(60),
                sweep_every: Some(Duration::from_secs(300)),
                trust_forwarded: false,
            },
            safety: SafetyConfig::default(),
            safety_classifiers: parse_classifier_order(None),
            model: ModelConfig {
                url: None,
                token: None,
                model_id: DEFAULT_MODEL_ID.to_string(),
                timeout: Duration::from_secs(30),
            },
            storage: StorageConfig::Disabled,
            metrics_history: DEFAULT_HISTORY_CAPACITY,
            max_request_bytes: 10 * 1024 * 1024,
            log_file: None,
            rotation: RotationConfig {
                max_bytes: None,
                keep: 1,
                compress: false,
            },
            log_stdout: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let safety = if let Ok(path) = env::var("TITLER_SAFETY_CONFIG") {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read TITLER_SAFETY_CONFIG '{}'", path))?;
            serde_json::from_str::<SafetyConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse TITLER_SAFETY_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            defaults.safety
        };
        let safety_classifiers =
            parse_classifier_order(env::var("TITLER_SAFETY_CLASSIFIERS").ok().as_deref());

        let max_requests = parse_optional_u64("TITLER_RATE_LIMIT")?
            .map(|v| v as usize)
            .unwrap_or(defaults.rate_limit.max_requests);
        if max_requests == 0 {
            return Err(anyhow!("TITLER_RATE_LIMIT must be at least 1"));
        }
        let window = parse_optional_u64("TITLER_RATE_WINDOW_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.rate_limit.window);
        if window.is_zero() {
            return Err(anyhow!("TITLER_RATE_WINDOW_SECS must be at least 1"));
        }
        let sweep_every = match parse_optional_u64("TITLER_RATE_SWEEP_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.rate_limit.sweep_every,
        };
        let rate_limit = RateLimitConfig {
            max_requests,
            window,
            sweep_every,
            trust_forwarded: parse_bool_env("TITLER_TRUST_FORWARDED")?.unwrap_or(false),
        };

        let timeout = parse_optional_u64("TITLER_INFERENCE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.model.timeout);
        if timeout.is_zero() {
            return Err(anyhow!("TITLER_INFERENCE_TIMEOUT_MS must be at least 1"));
        }
        let model = ModelConfig {
            url: non_empty_var("TITLER_MODEL_URL"),
            token: non_empty_var("TITLER_MODEL_TOKEN"),
            model_id: non_empty_var("TITLER_MODEL_ID").unwrap_or(defaults.model.model_id),
            timeout,
        };

        let storage = match (
            non_empty_var("TITLER_STORAGE_DIR"),
            non_empty_var("TITLER_STORAGE_URL"),
        ) {
            (Some(_), Some(_)) => {
                return Err(anyhow!(
                    "TITLER_STORAGE_DIR and TITLER_STORAGE_URL are mutually exclusive"
                ))
            }
            (Some(dir), None) => StorageConfig::Local { dir },
            (None, Some(url)) => StorageConfig::Http {
                url,
                token: non_empty_var("TITLER_STORAGE_TOKEN"),
            },
            (None, None) => StorageConfig::Disabled,
        };

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            rate_limit,
            safety,
            safety_classifiers,
            model,
            storage,
            metrics_history: parse_optional_u64("TITLER_METRICS_HISTORY")?
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(defaults.metrics_history),
            max_request_bytes: parse_optional_u64("TITLER_MAX_REQUEST_BYTES")?
                .map(|v| v as usize)
                .unwrap_or(defaults.max_request_bytes),
            log_file: non_empty_var("LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("TITLER_LOG_STDOUT")?.unwrap_or(false),
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
