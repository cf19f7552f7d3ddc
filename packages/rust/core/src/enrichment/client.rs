//! Chat-completions client for the enrichment API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use dailybrief_shared::{DailyBriefError, EnrichmentConfig, Result};

/// User-Agent string for enrichment requests.
const USER_AGENT: &str = concat!("DailyBrief/", env!("CARGO_PKG_VERSION"));

/// Longest error body we keep in a failure message.
const MAX_ERROR_BODY: usize = 300;

/// Failure of a single enrichment request.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request exceeded its deadline.
    #[error("enrichment request timed out")]
    Timeout,

    /// Credentials were rejected. Retrying cannot help.
    #[error("enrichment API rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    /// Network failure, server error, rate limit or unusable envelope.
    #[error("enrichment API failure: {0}")]
    Transient(String),
}

impl ApiError {
    /// Whether this failure must abort the run instead of charging a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// The external enrichment service. Returns the raw response text.
#[async_trait]
pub trait EnrichmentApi: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> std::result::Result<String, ApiError>;
}

// ---------------------------------------------------------------------------
// OpenRouter (OpenAI-compatible) client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenRouterClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(config: &EnrichmentConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DailyBriefError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl EnrichmentApi for OpenRouterClient {
    async fn complete(&self, messages: &[ChatMessage]) -> std::result::Result<String, ApiError> {
        let start = std::time::Instant::now();
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: 0.3,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout
                } else {
                    ApiError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let snippet: String = error_text.chars().take(MAX_ERROR_BODY).collect();
            warn!(%status, error = %snippet, "enrichment API error");
            return Err(ApiError::Transient(format!("HTTP {status}: {snippet}")));
        }

        let raw: ChatResponseRaw = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout
            } else {
                ApiError::Transient(format!("malformed response envelope: {e}"))
            }
        })?;

        let content = raw
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ApiError::Transient("response contained no message".into()))?;

        debug!(
            model = %self.model,
            duration_ms = start.elapsed().as_millis(),
            bytes = content.len(),
            "chat completion"
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String, timeout_secs: u64) -> EnrichmentConfig {
        EnrichmentConfig {
            base_url,
            timeout_secs,
            ..EnrichmentConfig::default()
        }
    }

    #[tokio::test]
    async fn returns_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"items\":[]}"}}]
            })))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new(&config(server.uri(), 5), "sk-test".into()).unwrap();
        let body = client
            .complete(&[ChatMessage::user("hello")])
            .await
            .unwrap();
        assert_eq!(body, r#"{"items":[]}"#);
    }

    #[tokio::test]
    async fn auth_rejection_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new(&config(server.uri(), 5), "sk-bad".into()).unwrap();
        let err = client.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(401)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new(&config(server.uri(), 5), "sk".into()).unwrap();
        let err = client.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ApiError::Transient(ref m) if m.contains("503")));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = OpenRouterClient::new(&config(server.uri(), 1), "sk".into()).unwrap();
        let err = client.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ApiError::Timeout));
    }

    #[tokio::test]
    async fn empty_choices_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new(&config(server.uri(), 5), "sk".into()).unwrap();
        let err = client.complete(&[ChatMessage::user("x")]).await.unwrap_err();
        assert!(matches!(err, ApiError::Transient(_)));
    }
}
