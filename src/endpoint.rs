//! Chat-completion endpoint abstraction.
//!
//! This module defines the `ChatEndpoint` trait to abstract the transport
//! the dispatcher sends requests over, enabling testability with mock
//! implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::EndpointError;

/// A single message in a chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A request to a chat-completion endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

/// Token usage reported alongside a completion.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub cached_tokens: u32,
    pub total_tokens: u32,
}

/// The result of a successful chat-completion call.
#[derive(Debug, Clone)]
pub struct ChatCompletionResponse {
    pub content: String,
    pub usage: Usage,
}

/// Trait for executing chat-completion requests.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the dispatcher's retry and rate-limit logic testable
/// without making real network calls.
///
/// # Example
/// ```ignore
/// let endpoint = ReqwestChatEndpoint::new(base_url, api_key);
/// let response = endpoint.chat(request).await?;
/// println!("{}", response.content);
/// ```
#[async_trait]
pub trait ChatEndpoint: Send + Sync {
    /// Execute a chat-completion request.
    ///
    /// # Errors
    /// Returns [`EndpointError::RateLimited`] if the provider signals a rate
    /// limit, [`EndpointError::Transient`] for retryable failures, and
    /// [`EndpointError::Permanent`] for failures retries will not fix.
    async fn chat(&self, request: ChatCompletionRequest) -> Result<ChatCompletionResponse, EndpointError>;
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

#[derive(Deserialize)]
struct RawChoice {
    message: RawMessage,
}

#[derive(Deserialize)]
struct RawMessage {
    content: String,
}

#[derive(Deserialize)]
struct RawPromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

#[derive(Deserialize)]
struct RawUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<RawPromptTokensDetails>,
}

#[derive(Deserialize)]
struct RawChatCompletion {
    choices: Vec<RawChoice>,
    usage: RawUsage,
}

/// Production chat endpoint, posting to an OpenAI-compatible
/// `/chat/completions` route.
pub struct ReqwestChatEndpoint {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl ReqwestChatEndpoint {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ChatEndpoint for ReqwestChatEndpoint {
    #[tracing::instrument(skip(self, request), fields(model = %request.model))]
    async fn chat(&self, request: ChatCompletionRequest) -> Result<ChatCompletionResponse, EndpointError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        tracing::debug!(url = %url, "sending chat completion request");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            tracing::warn!(retry_after = ?retry_after, "endpoint reported rate limit");
            return Err(EndpointError::RateLimited { retry_after });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "transient endpoint error");
            return Err(EndpointError::Transient(format!("{status}: {body}")));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "permanent endpoint error");
            return Err(EndpointError::Permanent(format!("{status}: {body}")));
        }

        let body: RawChatCompletion = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EndpointError::Permanent("response had no choices".to_string()))?;

        let usage = Usage {
            prompt_tokens: body.usage.prompt_tokens,
            completion_tokens: body.usage.completion_tokens,
            cached_tokens: body
                .usage
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            total_tokens: body.usage.total_tokens,
        };

        tracing::info!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cached_tokens = usage.cached_tokens,
            "chat completion succeeded"
        );

        Ok(ChatCompletionResponse { content, usage })
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

/// Mock chat endpoint for testing.
///
/// Allows configuring predetermined responses per model without making
/// actual network calls.
///
/// # Example
/// ```ignore
/// let mock = MockChatEndpoint::new();
/// mock.add_response("gpt-fast", Ok(ChatCompletionResponse { .. }));
/// ```
#[derive(Clone)]
pub struct MockChatEndpoint {
    responses: Arc<Mutex<HashMap<String, Vec<Result<ChatCompletionResponse, EndpointError>>>>>,
    calls: Arc<Mutex<Vec<ChatCompletionRequest>>>,
}

impl MockChatEndpoint {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a response for `model`. Multiple calls stack in FIFO order.
    pub fn add_response(&self, model: &str, response: Result<ChatCompletionResponse, EndpointError>) {
        self.responses
            .lock()
            .entry(model.to_string())
            .or_default()
            .push(response);
    }

    pub fn get_calls(&self) -> Vec<ChatCompletionRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Default for MockChatEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatEndpoint for MockChatEndpoint {
    async fn chat(&self, request: ChatCompletionRequest) -> Result<ChatCompletionResponse, EndpointError> {
        let model = request.model.clone();
        self.calls.lock().push(request);

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&model) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        Err(EndpointError::Permanent(format!(
            "no mock response configured for model '{model}'"
        )))
    }
}

#[cfg(test)]
mod reqwest_endpoint_tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sample_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-fast".to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.1,
            max_tokens: None,
            response_format: None,
        }
    }

    #[tokio::test]
    async fn success_response_is_parsed_into_usage_and_content() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "hello there"}}],
                "usage": {
                    "prompt_tokens": 40,
                    "completion_tokens": 20,
                    "total_tokens": 60,
                    "prompt_tokens_details": {"cached_tokens": 10}
                }
            })))
            .mount(&mock_server)
            .await;

        let endpoint = ReqwestChatEndpoint::new(mock_server.uri(), "test-key");
        let response = endpoint.chat(sample_request()).await.unwrap();

        assert_eq!(response.content, "hello there");
        assert_eq!(response.usage.prompt_tokens, 40);
        assert_eq!(response.usage.cached_tokens, 10);
    }

    #[tokio::test]
    async fn http_429_surfaces_as_rate_limited_with_retry_after() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "5"))
            .mount(&mock_server)
            .await;

        let endpoint = ReqwestChatEndpoint::new(mock_server.uri(), "test-key");
        let err = endpoint.chat(sample_request()).await.unwrap_err();

        match err {
            EndpointError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(5)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_500_surfaces_as_transient() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&mock_server)
            .await;

        let endpoint = ReqwestChatEndpoint::new(mock_server.uri(), "test-key");
        let err = endpoint.chat(sample_request()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Transient(_)));
    }

    #[tokio::test]
    async fn http_400_surfaces_as_permanent() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&mock_server)
            .await;

        let endpoint = ReqwestChatEndpoint::new(mock_server.uri(), "test-key");
        let err = endpoint.chat(sample_request()).await.unwrap_err();
        assert!(matches!(err, EndpointError::Permanent(_)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.1,
            max_tokens: None,
            response_format: None,
        }
    }

    #[tokio::test]
    async fn mock_returns_queued_response() {
        let mock = MockChatEndpoint::new();
        mock.add_response(
            "gpt-fast",
            Ok(ChatCompletionResponse {
                content: "hello".to_string(),
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    cached_tokens: 0,
                    total_tokens: 15,
                },
            }),
        );

        let response = mock.chat(request("gpt-fast")).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn mock_errors_when_unconfigured() {
        let mock = MockChatEndpoint::new();
        let result = mock.chat(request("unknown")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn mock_responses_are_fifo() {
        let mock = MockChatEndpoint::new();
        mock.add_response(
            "m",
            Err(EndpointError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            }),
        );
        mock.add_response(
            "m",
            Ok(ChatCompletionResponse {
                content: "second".to_string(),
                usage: Usage::default(),
            }),
        );

        let first = mock.chat(request("m")).await;
        assert!(matches!(first, Err(EndpointError::RateLimited { .. })));
        let second = mock.chat(request("m")).await.unwrap();
        assert_eq!(second.content, "second");
    }
}
