//! Core request/result types submitted to and returned from a [`crate::Dispatcher`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier for a single item within a batch.
///
/// Uses a short, readable format like `"req_abc123xy"` rather than a raw
/// UUID, matching the rest of this codebase's id types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random request id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Convert to a short, readable string like `"req_deadbeef"`.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:x}", self.0.as_u128());
        format!("req_{}", &hex[..8])
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// One input to a batch: a caller-supplied id, the rendered prompt text
/// (after `{text}`/`extras` substitution has already happened), and an
/// optional JSON schema for structured output.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Caller-supplied id, or a generated [`RequestId`] if none was given.
    pub id: RequestId,
    /// The fully-rendered prompt text, sent as a single user-role message.
    pub prompt_text: String,
    /// Optional JSON schema requesting structured output.
    pub schema: Option<Value>,
}

impl ChatRequest {
    pub fn new(prompt_text: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            prompt_text: prompt_text.into(),
            schema: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// Classification of why a [`DispatchResult`] failed (or, for book-keeping,
/// why it is still in flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    RateLimitError,
    SchemaUnsupportedError,
    TransientApiError,
    PermanentApiError,
    RetryExhausted,
    ConfigError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::RateLimitError => "RateLimitError",
            ErrorKind::SchemaUnsupportedError => "SchemaUnsupportedError",
            ErrorKind::TransientApiError => "TransientApiError",
            ErrorKind::PermanentApiError => "PermanentApiError",
            ErrorKind::RetryExhausted => "RetryExhausted",
            ErrorKind::ConfigError => "ConfigError",
        };
        write!(f, "{s}")
    }
}

/// The outcome of dispatching a single [`ChatRequest`].
///
/// Exactly one `DispatchResult` is produced per submitted request, and the
/// list returned by `submit_batch` is aligned to input order.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub id: RequestId,
    pub success: bool,
    /// Raw text content returned by the model. Always present on success.
    pub content: Option<String>,
    /// `content` parsed against the request's schema, if one was supplied
    /// and parsing succeeded. A parse failure degrades to `None` here
    /// without failing the request.
    pub parsed_content: Option<Value>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    pub tokens_used: u32,
    pub cost: f64,
    pub api_response_time: Duration,
    pub processing_time: Duration,
    pub attempts: u32,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl DispatchResult {
    pub fn success(
        id: RequestId,
        content: String,
        parsed_content: Option<Value>,
        input_tokens: u32,
        output_tokens: u32,
        cached_tokens: u32,
        cost: f64,
        api_response_time: Duration,
        processing_time: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            id,
            success: true,
            content: Some(content),
            parsed_content,
            input_tokens,
            output_tokens,
            cached_tokens,
            tokens_used: input_tokens + output_tokens,
            cost,
            api_response_time,
            processing_time,
            attempts,
            error: None,
            error_kind: None,
        }
    }

    pub fn failure(
        id: RequestId,
        error: impl Into<String>,
        error_kind: ErrorKind,
        processing_time: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            id,
            success: false,
            content: None,
            parsed_content: None,
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            tokens_used: 0,
            cost: 0.0,
            api_response_time: Duration::ZERO,
            processing_time,
            attempts,
            error: Some(error.into()),
            error_kind: Some(error_kind),
        }
    }
}
