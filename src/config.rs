//! Dispatcher construction-time configuration.

use crate::error::{DispatchError, Result};

const MAX_CONCURRENT_CEILING: usize = 50;

/// Construction-time configuration for a [`crate::Dispatcher`].
///
/// One field per timing/limit knob, each with a sensible default, in the
/// style of a daemon config: build a `DispatcherConfig::default()` and
/// override only what the deployment needs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Model name, looked up in the pricing table at construction time.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// In-flight call cap. Clamped to [`MAX_CONCURRENT_CEILING`].
    pub max_concurrent: usize,
    /// Rolling tokens-per-minute ceiling enforced by the rate limiter.
    pub max_tpm: u32,
    pub adaptive_calibration: bool,

    pub api_key: String,
    pub base_url: String,
    pub environment: String,
    pub provider: String,
    pub correlation_id: Option<String>,

    /// Maximum in-call retry attempts for a single request.
    pub max_retry: u32,
    /// Fixed delay between in-call retry attempts.
    pub retry_delay_ms: u64,
}

impl DispatcherConfig {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_tpm(mut self, max_tpm: u32) -> Self {
        self.max_tpm = max_tpm;
        self
    }

    /// Validate and normalize the configuration. Called by
    /// `Dispatcher::new` before any state is constructed.
    pub fn validate(mut self) -> Result<Self> {
        if self.model.trim().is_empty() {
            return Err(DispatchError::Config("model must not be empty".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(DispatchError::Config("api_key must not be empty".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(DispatchError::Config("max_concurrent must be at least 1".to_string()));
        }
        self.max_concurrent = self.max_concurrent.min(MAX_CONCURRENT_CEILING);
        Ok(self)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.1,
            max_tokens: None,
            max_concurrent: 10,
            max_tpm: 180_000,
            adaptive_calibration: true,
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            environment: "production".to_string(),
            provider: "openai".to_string(),
            correlation_id: None,
            max_retry: 2,
            retry_delay_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DispatcherConfig::new("gpt-fast", "key", "https://api.example.com")
            .validate()
            .unwrap();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_retry, 2);
    }

    #[test]
    fn max_concurrent_is_clamped_to_ceiling() {
        let config = DispatcherConfig::new("gpt-fast", "key", "https://api.example.com")
            .with_max_concurrent(1000)
            .validate()
            .unwrap();
        assert_eq!(config.max_concurrent, MAX_CONCURRENT_CEILING);
    }

    #[test]
    fn empty_model_is_rejected() {
        let config = DispatcherConfig::new("", "key", "https://api.example.com");
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let config = DispatcherConfig::new("gpt-fast", "", "https://api.example.com");
        assert!(config.validate().is_err());
    }
}
