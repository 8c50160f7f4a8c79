use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

use super::{InferenceBackend, ModelOutput};
use crate::error::InvokeError;
use crate::upload::ImageUpload;

pub const DEFAULT_MODEL_ID: &str = "anthropic.claude-3-sonnet-20240229-v1:0";

const TITLE_PROMPT: &str = "Analyze this image and generate a concise, descriptive title. \
The title should be creative yet accurate, capturing the main subject and mood of the image. \
Respond only with a JSON object of the form \
{\"title\": \"...\", \"confidence\": 0.95, \"explanation\": \"...\"} \
where confidence is a number between 0 and 1.";

/// Posts the image to a messages-style model endpoint and reads the title
/// JSON out of the first text block of the reply.
///
/// Replies are accepted in three shapes: a messages reply whose first
/// content block holds the title JSON, a bare title object, or a caption
/// list `[{"generated_text": "...", "score": 0.8}]`.
pub struct HttpInferenceBackend {
    url: String,
    bearer_token: Option<String>,
    model_id: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpInferenceBackend {
    pub fn new(
        url: &str,
        bearer_token: Option<String>,
        model_id: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.to_string(),
            bearer_token,
            model_id: model_id.to_string(),
            timeout,
            client,
        })
    }

    fn request_body(&self, image: &ImageUpload) -> Value {
        json!({
            "anthropic_version": "bedrock-2023-05-31",
            "model": self.model_id,
            "max_tokens": 200,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": TITLE_PROMPT },
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.format.mime_type(),
                            "data": STANDARD.encode(&image.bytes),
                        }
                    }
                ]
            }]
        })
    }
}

#[async_trait::async_trait]
impl InferenceBackend for HttpInferenceBackend {
    fn name(&self) -> &str {
        &self.model_id
    }

    async fn infer(&self, image: &ImageUpload) -> Result<ModelOutput, InvokeError> {
        let mut rb = self.client.post(&self.url).json(&self.request_body(image));
        if let Some(tok) = &self.bearer_token {
            rb = rb.bearer_auth(tok);
        }
        let resp = rb.send().await.map_err(|e| self.classify_transport(e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.classify_transport(e))?;
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(InvokeError::UpstreamUnavailable(format!(
                "model endpoint returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(InvokeError::UpstreamRejected(format!(
                "model endpoint returned {}: {}",
                status,
                snippet(&text)
            )));
        }
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            InvokeError::UpstreamUnavailable(format!("model reply is not JSON: {}", e))
        })?;
        parse_reply(&body)
    }
}

impl HttpInferenceBackend {
    fn classify_transport(&self, err: reqwest::Error) -> InvokeError {
        if err.is_timeout() {
            InvokeError::Timeout(self.timeout)
        } else {
            InvokeError::UpstreamUnavailable(err.to_string())
        }
    }
}

fn snippet(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

/// Extract a [`ModelOutput`] from any of the accepted reply shapes.
pub(crate) fn parse_reply(body: &Value) -> Result<ModelOutput, InvokeError> {
    if body.get("stop_reason").and_then(Value::as_str) == Some("refusal") {
        return Err(InvokeError::UpstreamRejected(
            "model refused to title the image".into(),
        ));
    }
    if let Some(text) = body.pointer("/content/0/text").and_then(Value::as_str) {
        return parse_title_text(text);
    }
    if body.get("title").is_some() {
        return from_value(body.clone());
    }
    if let Some(first) = body.as_array().and_then(|a| a.first()) {
        if let Some(caption) = first.get("generated_text").and_then(Value::as_str) {
            return validate(ModelOutput {
                title: caption.trim().to_string(),
                confidence: first.get("score").and_then(Value::as_f64).unwrap_or(0.0),
                explanation: String::new(),
            });
        }
    }
    Err(InvokeError::UpstreamUnavailable(
        "model reply has no recognisable title".into(),
    ))
}

/// The model is asked for bare JSON but sometimes wraps it in prose or a
/// code fence; take the outermost braces.
fn parse_title_text(text: &str) -> Result<ModelOutput, InvokeError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &text[s..=e],
        _ => {
            return Err(InvokeError::UpstreamUnavailable(
                "model reply text holds no JSON object".into(),
            ))
        }
    };
    let value: Value = serde_json::from_str(json).map_err(|e| {
        InvokeError::UpstreamUnavailable(format!("model reply JSON is malformed: {}", e))
    })?;
    from_value(value)
}

fn from_value(value: Value) -> Result<ModelOutput, InvokeError> {
    let output: ModelOutput = serde_json::from_value(value).map_err(|e| {
        InvokeError::UpstreamUnavailable(format!("model reply JSON is malformed: {}", e))
    })?;
    validate(output)
}

fn validate(output: ModelOutput) -> Result<ModelOutput, InvokeError> {
    if output.title.trim().is_empty() {
        return Err(InvokeError::UpstreamUnavailable(
            "model reply has an empty title".into(),
        ));
    }
    Ok(output)
}
