//! Adaptive, rate-limited batch dispatcher for chat-completion APIs.
//!
//! Turns a list of input texts into a list of per-text results while
//! staying under a provider-imposed tokens-per-minute ceiling, bounding
//! in-flight concurrency, coordinating a global pause when the provider
//! reports a rate limit, and producing accurate per-request and per-batch
//! accounting.
//!
//! # Example
//! ```no_run
//! use dispatcher::{Dispatcher, DispatcherConfig, PricingTable, ReqwestChatEndpoint};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pricing = PricingTable::load_from_file("pricing.json")?;
//!     let config = DispatcherConfig::new("gpt-fast", "sk-...", "https://api.openai.com/v1");
//!     let endpoint = ReqwestChatEndpoint::new(&config.base_url, &config.api_key);
//!     let dispatcher = Dispatcher::new(config, pricing, endpoint)?;
//!
//!     let inputs = vec!["summarize: foo".to_string(), "summarize: bar".to_string()];
//!     let (results, batch_stats, batch_id) = dispatcher
//!         .submit_batch(inputs, "{text}", None, None, None)
//!         .await?;
//!
//!     println!("batch {batch_id}: {} results, cost {}", results.len(), batch_stats.cost_sum);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod pricing;
pub mod rate_limiter;
pub mod request;
pub mod stats;

// Re-export commonly used types at the crate root for convenience. These
// form the public interface most callers will interact with:
// - Core collaborator (Dispatcher) and its configuration (DispatcherConfig)
// - The endpoint abstraction (ChatEndpoint, ReqwestChatEndpoint, MockChatEndpoint)
// - Pricing (PricingTable, PricingEntry)
// - Rate limiting internals exposed for advanced callers (AdaptiveRateLimiter)
// - Request/result types (ChatRequest, DispatchResult, RequestId, ErrorKind)
// - Statistics (Stats, StatsManager, BatchHandle)
// - Error handling (DispatchError, EndpointError, Result)
pub use config::DispatcherConfig;
pub use dispatcher::Dispatcher;
pub use endpoint::{
    ChatCompletionRequest, ChatCompletionResponse, ChatEndpoint, ChatMessage, MockChatEndpoint,
    ReqwestChatEndpoint, Usage,
};
pub use error::{DispatchError, EndpointError, Result};
pub use pricing::{PricingEntry, PricingTable};
pub use rate_limiter::AdaptiveRateLimiter;
pub use request::{ChatRequest, DispatchResult, ErrorKind, RequestId};
pub use stats::{BatchHandle, Stats, StatsManager};

/// Install a `tracing-subscriber` `EnvFilter`-based global subscriber.
///
/// Intended for binaries and examples; library code never calls this
/// itself, so embedding applications keep control of their own logging
/// setup.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
