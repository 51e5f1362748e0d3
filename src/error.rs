//! Error types for the dispatcher.

use thiserror::Error;

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised synchronously, at submission or construction time.
///
/// Per-item failures during a batch never surface through this type; they
/// are attached to the offending item's [`crate::request::DispatchResult`]
/// instead (see [`crate::request::ErrorKind`]).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `ids` was supplied with a length different from `inputs`.
    #[error("validation error: {0}")]
    Validation(String),

    /// The configured model is unknown to the pricing table, or credentials
    /// are missing at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// A structured-output schema was requested for a model that does not
    /// support it.
    #[error("model '{model}' does not support structured output; compatible models: {}", .compatible.join(", "))]
    SchemaUnsupported {
        model: String,
        compatible: Vec<String>,
    },
}

/// Errors surfaced by a [`crate::endpoint::ChatEndpoint`] implementation.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The provider reported a rate limit (e.g. HTTP 429). `retry_after`
    /// carries the provider's own hint, when present.
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited { retry_after: Option<std::time::Duration> },

    /// A transient failure worth retrying in-call (timeouts, 5xx, connection
    /// resets).
    #[error("transient endpoint error: {0}")]
    Transient(String),

    /// A failure that retries will not fix (4xx other than 429, malformed
    /// request, auth failure).
    #[error("permanent endpoint error: {0}")]
    Permanent(String),

    /// Transport-level failure from the underlying HTTP client.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl EndpointError {
    /// Best-effort extraction of a rate-limit wait time from any endpoint
    /// error, for the dispatcher's recovery loop.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            EndpointError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error represents a server-reported rate limit, by the
    /// structured field or by a "token rate limit" substring convention.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            EndpointError::RateLimited { .. } => true,
            EndpointError::Transient(msg) | EndpointError::Permanent(msg) => {
                msg.to_lowercase().contains("token rate limit")
            }
            EndpointError::Transport(_) => false,
        }
    }
}
