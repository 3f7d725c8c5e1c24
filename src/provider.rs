use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Duration;

use crate::retry::{retry_with, RetryPolicy};

/// Status vocabulary shared by webhook deliveries and status polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Starting => "starting",
            ProviderStatus::Processing => "processing",
            ProviderStatus::Succeeded => "succeeded",
            ProviderStatus::Failed => "failed",
            ProviderStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Succeeded | ProviderStatus::Failed | ProviderStatus::Canceled
        )
    }
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prediction as reported by the provider, either in a webhook body or a
/// status poll response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPrediction {
    pub id: String,
    pub status: ProviderStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ProviderPrediction {
    pub fn output_url(&self) -> Option<String> {
        self.output.as_ref().and_then(extract_output_url)
    }

    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(message) if message.trim().is_empty() => None,
            Value::String(message) => Some(message.clone()),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(Value::Object(map.clone()).to_string())),
            other => Some(other.to_string()),
        }
    }
}

/// Output may be a bare URL, a list of URLs (first wins) or an object with a
/// `url`/`video` field.
pub fn extract_output_url(output: &Value) -> Option<String> {
    match output {
        Value::String(url) if !url.trim().is_empty() => Some(url.clone()),
        Value::Array(items) => items.iter().find_map(extract_output_url),
        Value::Object(map) => ["url", "video", "output"]
            .iter()
            .find_map(|field| map.get(*field).and_then(extract_output_url)),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionRequest {
    pub model_ref: String,
    pub version: Option<String>,
    pub input: Value,
    /// Set only when a publicly reachable callback exists.
    pub webhook: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unreachable: {0}")]
    Transport(String),
    #[error("provider returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(_) => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode(_) => false,
        }
    }
}

/// key: provider-adapter -> external video generation API
#[async_trait]
pub trait VideoProvider: Send + Sync {
    /// Source label used for idempotency keys and logs.
    fn name(&self) -> &str;

    async fn create_prediction(
        &self,
        request: &PredictionRequest,
    ) -> Result<ProviderPrediction, ProviderError>;

    async fn get_prediction(&self, external_id: &str) -> Result<ProviderPrediction, ProviderError>;
}

/// Replicate-style HTTP API: `POST predictions` / `POST models/{ref}/predictions`
/// and `GET predictions/{id}`.
#[derive(Clone)]
pub struct HttpVideoProvider {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    name: String,
    retry: RetryPolicy,
}

impl HttpVideoProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        name: impl Into<String>,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build provider client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_token,
            name: name.into(),
            retry,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.api_token {
            request.bearer_auth(token)
        } else {
            request
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ProviderPrediction, ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }
        response
            .json::<ProviderPrediction>()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))
    }
}

fn truncate(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[async_trait]
impl VideoProvider for HttpVideoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_prediction(
        &self,
        request: &PredictionRequest,
    ) -> Result<ProviderPrediction, ProviderError> {
        let (path, mut payload) = match &request.version {
            Some(version) => (
                "predictions".to_string(),
                json!({ "version": version, "input": request.input }),
            ),
            None => (
                format!("models/{}/predictions", request.model_ref),
                json!({ "input": request.input }),
            ),
        };
        if let Some(webhook) = &request.webhook {
            payload["webhook"] = json!(webhook);
            payload["webhook_events_filter"] = json!(["start", "completed"]);
        }

        retry_with(
            &self.retry,
            "provider.create_prediction",
            ProviderError::is_transient,
            || {
                self.send(
                    self.auth(self.client.post(self.endpoint(&path)))
                        .json(&payload),
                )
            },
        )
        .await
    }

    async fn get_prediction(&self, external_id: &str) -> Result<ProviderPrediction, ProviderError> {
        let path = format!("predictions/{external_id}");
        let prediction = retry_with(
            &self.retry,
            "provider.get_prediction",
            ProviderError::is_transient,
            || self.send(self.auth(self.client.get(self.endpoint(&path)))),
        )
        .await?;
        if prediction.id != external_id {
            return Err(ProviderError::Decode(format!(
                "asked for prediction {external_id}, got {}",
                prediction.id
            )));
        }
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_url_extraction_handles_common_shapes() {
        assert_eq!(
            extract_output_url(&json!("https://cdn.example/video.mp4")).as_deref(),
            Some("https://cdn.example/video.mp4")
        );
        assert_eq!(
            extract_output_url(&json!(["", "https://cdn.example/a.mp4"])).as_deref(),
            Some("https://cdn.example/a.mp4")
        );
        assert_eq!(
            extract_output_url(&json!({ "video": "https://cdn.example/b.mp4" })).as_deref(),
            Some("https://cdn.example/b.mp4")
        );
        assert_eq!(extract_output_url(&json!(null)), None);
        assert_eq!(extract_output_url(&json!([])), None);
        assert_eq!(extract_output_url(&json!({ "frames": 120 })), None);
    }

    #[test]
    fn error_message_prefers_message_field() {
        let prediction: ProviderPrediction = serde_json::from_value(json!({
            "id": "p1",
            "status": "failed",
            "error": { "message": "NSFW content detected" }
        }))
        .unwrap();
        assert_eq!(
            prediction.error_message().as_deref(),
            Some("NSFW content detected")
        );
    }

    #[test]
    fn unknown_status_fails_to_decode() {
        let result: Result<ProviderPrediction, _> =
            serde_json::from_value(json!({ "id": "p1", "status": "exploded" }));
        assert!(result.is_err());
    }

    #[test]
    fn only_transport_and_server_errors_are_transient() {
        assert!(ProviderError::Transport("reset".into()).is_transient());
        assert!(ProviderError::Api { status: 503, body: String::new() }.is_transient());
        assert!(ProviderError::Api { status: 429, body: String::new() }.is_transient());
        assert!(!ProviderError::Api { status: 422, body: String::new() }.is_transient());
        assert!(!ProviderError::Decode("bad json".into()).is_transient());
    }
}
