//! Content safety gate.
//!
//! The gate runs an ordered list of [`SafetyClassifier`]s against the upload
//! before the model is called and against the generated caption afterwards.
//! The first rejection wins. The built-in classifiers are heuristics (byte
//! and dimension limits, keyword deny-list); they are not a moderation model
//! and do not guarantee that disallowed content is caught.

use std::sync::Arc;

use crate::upload::ImageUpload;

pub mod keywords;
pub mod limits;

use self::keywords::KeywordClassifier;
use self::limits::LimitsClassifier;

pub const DEFAULT_CLASSIFIERS: [&str; 2] = ["limits", "keywords"];

/// Safety policy loaded from `TITLER_SAFETY_CONFIG` or defaults.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct SafetyConfig {
    /// Case-insensitive substrings rejected in upload text and captions.
    #[serde(default = "default_deny_keywords", alias = "denyKeywords")]
    pub deny_keywords: Vec<String>,
    #[serde(default = "default_max_image_bytes", alias = "maxImageBytes")]
    pub max_image_bytes: usize,
    /// Largest accepted width or height in pixels.
    #[serde(default = "default_max_dimension", alias = "maxDimension")]
    pub max_dimension: u32,
    /// Detail returned when a keyword matches.
    #[serde(default = "default_rejection_reason", alias = "rejectionReason")]
    pub rejection_reason: String,
}

fn default_deny_keywords() -> Vec<String> {
    ["nude", "naked", "explicit", "porn", "adult", "nsfw"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_image_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_max_dimension() -> u32 {
    4096
}

fn default_rejection_reason() -> String {
    "Image content appears to be inappropriate".to_owned()
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            deny_keywords: default_deny_keywords(),
            max_image_bytes: default_max_image_bytes(),
            max_dimension: default_max_dimension(),
            rejection_reason: default_rejection_reason(),
        }
    }
}

/// What a classifier is asked to judge.
#[derive(Debug, Clone, Copy)]
pub enum SafetyInput<'a> {
    Image(&'a ImageUpload),
    Caption(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Reason is returned verbatim to the caller.
    Rejected(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

#[async_trait::async_trait]
pub trait SafetyClassifier: Send + Sync {
    fn name(&self) -> &str;
    async fn classify(&self, input: SafetyInput<'_>) -> Verdict;
}

#[derive(Clone, Default)]
pub struct SafetyGate {
    classifiers: Vec<Arc<dyn SafetyClassifier>>,
}

impl SafetyGate {
    /// Build the gate from classifier names. Unknown names are skipped.
    pub fn new(order: &[String], cfg: &SafetyConfig) -> anyhow::Result<Self> {
        let mut classifiers: Vec<Arc<dyn SafetyClassifier>> = Vec::new();
        for name in order {
            match name.as_str() {
                "limits" => classifiers.push(Arc::new(LimitsClassifier::new(
                    cfg.max_image_bytes,
                    cfg.max_dimension,
                ))),
                "keywords" => classifiers.push(Arc::new(KeywordClassifier::new(
                    &cfg.deny_keywords,
                    cfg.rejection_reason.clone(),
                )?)),
                _ => {
                    tracing::warn!(classifier = %name, "unknown safety classifier name, skipping");
                }
            }
        }
        Ok(Self { classifiers })
    }

    pub fn with_classifiers(classifiers: Vec<Arc<dyn SafetyClassifier>>) -> Self {
        Self { classifiers }
    }

    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }

    pub async fn check_input(&self, upload: &ImageUpload) -> Verdict {
        self.run(SafetyInput::Image(upload)).await
    }

    pub async fn check_output(&self, text: &str) -> Verdict {
        self.run(SafetyInput::Caption(text)).await
    }

    async fn run(&self, input: SafetyInput<'_>) -> Verdict {
        for classifier in &self.classifiers {
            let verdict = classifier.classify(input).await;
            if let Verdict::Rejected(reason) = &verdict {
                tracing::info!(classifier = classifier.name(), %reason, "safety gate rejected");
                return verdict;
            }
        }
        Verdict::Allowed
    }
}

/// Parse a comma separated classifier list. Names are trimmed and lower-cased.
pub fn parse_classifier_order(raw: Option<&str>) -> Vec<String> {
    match raw {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => DEFAULT_CLASSIFIERS.iter().map(|s| s.to_string()).collect(),
    }
}
