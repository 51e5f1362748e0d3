//! The batch processor: orchestrates concurrent endpoint calls through the
//! rate limiter, attributes results to their original indices, retries
//! rate-limited items, and feeds the stats manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::endpoint::{ChatCompletionRequest, ChatEndpoint};
use crate::error::{DispatchError, EndpointError, Result};
use crate::pricing::{PricingEntry, PricingTable};
use crate::rate_limiter::AdaptiveRateLimiter;
use crate::request::{ChatRequest, DispatchResult, ErrorKind, RequestId};
use crate::stats::{Stats, StatsManager};

const RATE_LIMIT_GRACE: Duration = Duration::from_millis(100);
/// Rough characters-per-token ratio used to pre-call estimate token usage
/// before the real count is known from the endpoint's response.
const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// Outcome of one endpoint attempt for a single item, before the batch loop
/// decides whether to finalize it or resubmit it in the next pass.
enum AttemptOutcome {
    /// The request finalized, plus the total time spent asleep in the rate
    /// limiter's gate (coordinated pause + proactive TPM wait) across every
    /// attempt this item took.
    Done(DispatchResult, Duration),
    RateLimited { retry_after: Duration, attempts: u32, waited: Duration },
}

/// Adaptive, rate-limited batch dispatcher for chat-completion APIs.
///
/// Owns its [`AdaptiveRateLimiter`] and [`StatsManager`] exclusively; the
/// pricing table and endpoint are shared, immutable collaborators.
pub struct Dispatcher<E: ChatEndpoint> {
    config: DispatcherConfig,
    pricing: PricingTable,
    endpoint: Arc<E>,
    rate_limiter: Arc<AdaptiveRateLimiter>,
    stats: Arc<StatsManager>,
    semaphore: Arc<Semaphore>,
}

impl<E: ChatEndpoint> std::fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl<E: ChatEndpoint + 'static> Dispatcher<E> {
    /// Construct a dispatcher. Fails fast (synchronously) if the configured
    /// model is unknown to the pricing table or the config is invalid.
    pub fn new(config: DispatcherConfig, pricing: PricingTable, endpoint: E) -> Result<Self> {
        let config = config.validate()?;

        if !pricing.contains(&config.model) {
            return Err(DispatchError::Config(format!(
                "model '{}' is not present in the pricing table",
                config.model
            )));
        }

        let rate_limiter = Arc::new(AdaptiveRateLimiter::new(config.max_tpm, config.adaptive_calibration));
        let stats = Arc::new(StatsManager::new(config.max_concurrent));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        Ok(Self {
            config,
            pricing,
            endpoint: Arc::new(endpoint),
            rate_limiter,
            stats,
            semaphore,
        })
    }

    /// Render `prompt_template` for one input, substituting `{text}` and
    /// any keys present in `extras`.
    fn render_prompt(&self, template: &str, text: &str, extras: &HashMap<String, String>) -> String {
        let mut rendered = template.replace("{text}", text);
        for (key, value) in extras {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        rendered
    }

    fn progress_milestone(batch_size: usize, completed: usize) -> bool {
        if batch_size <= 5 {
            return true;
        }
        completed == 1 || completed % 5 == 0 || completed == batch_size
    }

    /// Validate inputs and build the per-item [`ChatRequest`] list.
    fn build_requests(
        &self,
        inputs: &[String],
        template: &str,
        schema: Option<&Value>,
        ids: Option<&[RequestId]>,
        extras: Option<&HashMap<String, String>>,
    ) -> Result<Vec<ChatRequest>> {
        if let Some(ids) = ids {
            if ids.len() != inputs.len() {
                return Err(DispatchError::Validation(format!(
                    "ids length {} does not match inputs length {}",
                    ids.len(),
                    inputs.len()
                )));
            }
        }

        if schema.is_some() && !self.pricing.supports_json_schema(&self.config.model) {
            return Err(DispatchError::SchemaUnsupported {
                model: self.config.model.clone(),
                compatible: self.pricing.compatible_models(),
            });
        }

        let empty_extras = HashMap::new();
        let extras = extras.unwrap_or(&empty_extras);

        Ok(inputs
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let prompt_text = self.render_prompt(template, text, extras);
                let mut request = ChatRequest::new(prompt_text);
                if let Some(ids) = ids {
                    request = request.with_id(ids[i]);
                }
                if let Some(schema) = schema {
                    request = request.with_schema(schema.clone());
                }
                request
            })
            .collect())
    }

    /// Produce one Result per input; result list is aligned to input order.
    #[allow(clippy::too_many_arguments)]
    pub async fn submit_batch(
        &self,
        inputs: Vec<String>,
        prompt_template: &str,
        schema: Option<Value>,
        ids: Option<Vec<RequestId>>,
        extras: Option<HashMap<String, String>>,
    ) -> Result<(Vec<DispatchResult>, Stats, String)> {
        let requests = self.build_requests(
            &inputs,
            prompt_template,
            schema.as_ref(),
            ids.as_deref(),
            extras.as_ref(),
        )?;

        let batch_size = requests.len();
        let batch_id = Uuid::new_v4().to_string();
        let handle = self.stats.start_batch(batch_id.clone());
        let batch_start = Instant::now();

        let mut results: Vec<Option<DispatchResult>> = vec![None; batch_size];
        let mut attempts_so_far: Vec<u32> = vec![0; batch_size];
        let mut wait_so_far: Vec<Duration> = vec![Duration::ZERO; batch_size];
        let mut rate_limited_so_far: Vec<bool> = vec![false; batch_size];
        let mut pending: Vec<usize> = (0..batch_size).collect();
        let mut requests: Vec<Option<ChatRequest>> = requests.into_iter().map(Some).collect();
        let completed = Arc::new(AtomicUsize::new(0));

        tracing::info!(batch_id = %batch_id, batch_size, "batch submission started");

        while !pending.is_empty() {
            let mut join_set: JoinSet<(usize, AttemptOutcome)> = JoinSet::new();
            let mut rate_limit_recorded_this_pass = false;

            for &idx in &pending {
                let request = requests[idx].take().expect("request present while pending");
                let attempts = attempts_so_far[idx];
                let prior_wait = wait_so_far[idx];
                let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let stats = self.stats.clone();
                let this = self.shallow_clone();

                stats.record_concurrent_start();
                join_set.spawn(async move {
                    let _permit = permit;
                    let _guard = scopeguard::guard((), |_| stats.record_concurrent_end());
                    let outcome = this.dispatch_one(request, attempts, prior_wait).await;
                    (idx, outcome)
                });
            }

            let mut next_pending = Vec::new();

            while let Some(joined) = join_set.join_next().await {
                let (idx, outcome) = joined.expect("dispatch task does not panic");

                match outcome {
                    AttemptOutcome::Done(result, waited) => {
                        self.stats.record_request(
                            result.success,
                            result.input_tokens,
                            result.output_tokens,
                            result.cached_tokens,
                            result.cost,
                            result.api_response_time,
                            result.error_kind,
                            result.attempts.saturating_sub(1),
                            rate_limited_so_far[idx],
                            waited,
                            &self.config.model,
                        );

                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        if Self::progress_milestone(batch_size, done) {
                            let rate = done as f64 / batch_start.elapsed().as_secs_f64().max(0.001);
                            let eta = if rate > 0.0 {
                                Duration::from_secs_f64((batch_size - done) as f64 / rate)
                            } else {
                                Duration::ZERO
                            };
                            tracing::info!(
                                batch_id = %batch_id,
                                completed = done,
                                total = batch_size,
                                rate_per_sec = rate,
                                eta_secs = eta.as_secs_f64(),
                                "batch progress"
                            );
                        }

                        results[idx] = Some(result);
                    }
                    AttemptOutcome::RateLimited { retry_after, attempts, waited } => {
                        attempts_so_far[idx] = attempts;
                        wait_so_far[idx] = waited;
                        rate_limited_so_far[idx] = true;

                        // Rebuild the request the same way `build_requests` did;
                        // the original was moved into the spawned task above.
                        let prompt_text = self.render_prompt(
                            prompt_template,
                            &inputs[idx],
                            extras.as_ref().unwrap_or(&HashMap::new()),
                        );
                        let mut request = ChatRequest::new(prompt_text);
                        if let Some(ids) = &ids {
                            request = request.with_id(ids[idx]);
                        }
                        if let Some(schema) = &schema {
                            request = request.with_schema(schema.clone());
                        }
                        requests[idx] = Some(request);
                        next_pending.push(idx);

                        if !rate_limit_recorded_this_pass {
                            self.rate_limiter.record_api_rate_limit(retry_after);
                            rate_limit_recorded_this_pass = true;
                        }
                    }
                }
            }

            if !next_pending.is_empty() {
                tokio::time::sleep(RATE_LIMIT_GRACE).await;
            }

            pending = next_pending;
        }

        self.stats.add_processing_time(batch_start.elapsed());
        let batch_stats = self.stats.end_batch(handle);

        let results: Vec<DispatchResult> = results
            .into_iter()
            .map(|r| r.expect("every index is finalized before the loop exits"))
            .collect();

        tracing::info!(batch_id = %batch_id, batch_size, "batch submission finished");

        Ok((results, batch_stats, batch_id))
    }

    /// Equivalent to a one-element batch minus the batch bookkeeping.
    pub async fn submit_single(
        &self,
        text: String,
        prompt_template: &str,
        schema: Option<Value>,
        id: Option<RequestId>,
        extras: Option<HashMap<String, String>>,
    ) -> Result<DispatchResult> {
        let ids = id.map(|id| vec![id]);
        let (mut results, _, _) = self
            .submit_batch(vec![text], prompt_template, schema, ids, extras)
            .await?;
        Ok(results.remove(0))
    }

    pub fn get_global_stats(&self) -> Stats {
        self.stats.global_stats()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Returns `batch_result` alongside the global stats snapshot, unless
    /// the caller opts out of including the global view.
    pub fn get_complete_stats(&self, batch_result: Option<Stats>, include_global: bool) -> (Option<Stats>, Option<Stats>) {
        let global = if include_global { Some(self.stats.global_stats()) } else { None };
        (batch_result, global)
    }

    /// Cheap clone of the handles needed inside a spawned task, without
    /// cloning the pricing table or config.
    fn shallow_clone(&self) -> DispatcherHandle<E> {
        DispatcherHandle {
            config: self.config.clone(),
            pricing: self.pricing.clone(),
            endpoint: self.endpoint.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

/// The subset of [`Dispatcher`] state a spawned per-request task needs.
/// Avoids cloning the semaphore or stats manager into every task, since
/// those are acquired/updated by the caller around the spawn point.
struct DispatcherHandle<E: ChatEndpoint> {
    config: DispatcherConfig,
    pricing: PricingTable,
    endpoint: Arc<E>,
    rate_limiter: Arc<AdaptiveRateLimiter>,
}

impl<E: ChatEndpoint + 'static> DispatcherHandle<E> {
    fn pricing_entry(&self) -> &PricingEntry {
        self.pricing
            .get(&self.config.model)
            .expect("model presence checked at construction")
    }

    fn estimate_tokens(&self, prompt_text: &str) -> u32 {
        let chars = prompt_text.len().max(1);
        let estimate = (chars / CHARS_PER_TOKEN_ESTIMATE).max(1) as u32;
        estimate + self.config.max_tokens.unwrap_or(256)
    }

    #[tracing::instrument(skip(self, request), fields(request_id = %request.id))]
    async fn dispatch_one(&self, request: ChatRequest, mut attempts: u32, prior_wait: Duration) -> AttemptOutcome {
        let start = Instant::now();
        let pricing = self.pricing_entry();
        let mut waited = prior_wait;

        loop {
            attempts += 1;
            let estimate = self.estimate_tokens(&request.prompt_text);
            let (calibrated, slept) = self.rate_limiter.acquire(estimate).await;
            waited += slept;

            let chat_request = ChatCompletionRequest {
                model: self.config.model.clone(),
                messages: vec![crate::endpoint::ChatMessage::user(&request.prompt_text)],
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
                response_format: request.schema.clone(),
            };

            let call_start = Instant::now();
            match self.endpoint.chat(chat_request).await {
                Ok(response) => {
                    let api_response_time = call_start.elapsed();
                    let usage = response.usage;
                    self.rate_limiter.record_tokens(calibrated, usage.total_tokens);

                    let cost = pricing.cost(usage.prompt_tokens, usage.completion_tokens, usage.cached_tokens);
                    let parsed_content = request
                        .schema
                        .as_ref()
                        .and_then(|_| serde_json::from_str::<Value>(&response.content).ok());

                    return AttemptOutcome::Done(
                        DispatchResult::success(
                            request.id,
                            response.content,
                            parsed_content,
                            usage.prompt_tokens,
                            usage.completion_tokens,
                            usage.cached_tokens,
                            cost,
                            api_response_time,
                            start.elapsed(),
                            attempts,
                        ),
                        waited,
                    );
                }
                Err(EndpointError::RateLimited { retry_after }) => {
                    let wait = self
                        .rate_limiter
                        .parse_wait_time(retry_after, "token rate limit");
                    return AttemptOutcome::RateLimited { retry_after: wait, attempts, waited };
                }
                Err(err @ EndpointError::Transient(_)) | Err(err @ EndpointError::Transport(_)) => {
                    if err.is_rate_limit() {
                        let wait = self.rate_limiter.parse_wait_time(None, &err.to_string());
                        return AttemptOutcome::RateLimited { retry_after: wait, attempts, waited };
                    }
                    if attempts < self.config.max_retry {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                        continue;
                    }
                    return AttemptOutcome::Done(
                        DispatchResult::failure(
                            request.id,
                            err.to_string(),
                            ErrorKind::RetryExhausted,
                            start.elapsed(),
                            attempts,
                        ),
                        waited,
                    );
                }
                Err(err @ EndpointError::Permanent(_)) => {
                    if err.is_rate_limit() {
                        let wait = self.rate_limiter.parse_wait_time(None, &err.to_string());
                        return AttemptOutcome::RateLimited { retry_after: wait, attempts, waited };
                    }
                    return AttemptOutcome::Done(
                        DispatchResult::failure(
                            request.id,
                            err.to_string(),
                            ErrorKind::PermanentApiError,
                            start.elapsed(),
                            attempts,
                        ),
                        waited,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ChatCompletionResponse, MockChatEndpoint, Usage};

    fn pricing() -> PricingTable {
        PricingTable::from_json(
            r#"{"gpt-fast": {"input": 0.001, "output": 0.002, "cache": 0.0005, "json_schema": true}}"#,
        )
        .unwrap()
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig::new("gpt-fast", "key", "https://api.example.com").with_max_concurrent(2)
    }

    fn ok_response(prompt: u32, completion: u32, cached: u32) -> std::result::Result<ChatCompletionResponse, EndpointError> {
        Ok(ChatCompletionResponse {
            content: "hi".to_string(),
            usage: Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                cached_tokens: cached,
                total_tokens: prompt + completion,
            },
        })
    }

    #[tokio::test]
    async fn scenario_1_cost_and_cache_hit_rate() {
        let mock = MockChatEndpoint::new();
        for _ in 0..3 {
            mock.add_response("gpt-fast", ok_response(50, 20, 10));
        }
        let dispatcher = Dispatcher::new(config(), pricing(), mock).unwrap();

        let inputs = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (results, stats, _) = dispatcher
            .submit_batch(inputs, "say {text}", None, None, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert!((stats.cost_sum - 0.000_255).abs() < 1e-9);
        assert!((stats.cache_hit_rate() - 10.0 / 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scenario_2_concurrency_cap_and_input_order() {
        let mock = MockChatEndpoint::new();
        for _ in 0..10 {
            mock.add_response("gpt-fast", ok_response(10, 5, 0));
        }
        let dispatcher = Dispatcher::new(config().with_max_concurrent(2), pricing(), mock).unwrap();

        let inputs: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let ids: Vec<RequestId> = (0..10).map(|_| RequestId::new()).collect();
        let (results, _, _) = dispatcher
            .submit_batch(inputs, "say {text}", None, Some(ids.clone()), None)
            .await
            .unwrap();

        assert_eq!(results.len(), 10);
        for (result, expected_id) in results.iter().zip(ids.iter()) {
            assert_eq!(result.id, *expected_id);
        }
    }

    #[tokio::test]
    async fn scenario_3_rate_limit_recovery() {
        let mock = MockChatEndpoint::new();
        mock.add_response(
            "gpt-fast",
            Err(EndpointError::RateLimited { retry_after: Some(Duration::from_millis(5)) }),
        );
        for _ in 0..5 {
            mock.add_response("gpt-fast", ok_response(10, 5, 0));
        }
        let dispatcher = Dispatcher::new(config(), pricing(), mock).unwrap();

        let inputs: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let (results, stats, _) = dispatcher
            .submit_batch(inputs, "say {text}", None, None, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(stats.failed_requests, 0);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn mismatched_ids_length_is_validation_error() {
        let dispatcher = Dispatcher::new(config(), pricing(), MockChatEndpoint::new()).unwrap();
        let err = dispatcher
            .submit_batch(
                vec!["a".to_string(), "b".to_string()],
                "say {text}",
                None,
                Some(vec![RequestId::new()]),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn schema_on_incompatible_model_is_rejected() {
        let table = PricingTable::from_json(
            r#"{"gpt-slow": {"input": 0.01, "output": 0.03, "cache": 0.005}}"#,
        )
        .unwrap();
        let config = DispatcherConfig::new("gpt-slow", "key", "https://api.example.com");
        let dispatcher = Dispatcher::new(config, table, MockChatEndpoint::new()).unwrap();

        let err = dispatcher
            .submit_batch(
                vec!["a".to_string()],
                "say {text}",
                Some(serde_json::json!({"type": "object"})),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SchemaUnsupported { .. }));
    }

    #[tokio::test]
    async fn scenario_4_transient_retries_then_succeeds_with_max_retry_three() {
        // MAX_RETRY caps total attempts, so reaching a third (successful)
        // attempt after two transient failures requires max_retry=3.
        let mock = MockChatEndpoint::new();
        mock.add_response("gpt-fast", Err(EndpointError::Transient("timeout".to_string())));
        mock.add_response("gpt-fast", Err(EndpointError::Transient("timeout".to_string())));
        mock.add_response("gpt-fast", ok_response(10, 5, 0));
        let mut cfg = config();
        cfg.max_retry = 3;
        let dispatcher = Dispatcher::new(cfg, pricing(), mock).unwrap();

        let result = dispatcher
            .submit_single("a".to_string(), "say {text}", None, None, None)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn scenario_4_transient_failures_exhaust_retries_under_max_retry_two() {
        // Same two transient failures, but with the default max_retry=2 the
        // third (successful) attempt is never reached.
        let mock = MockChatEndpoint::new();
        mock.add_response("gpt-fast", Err(EndpointError::Transient("timeout".to_string())));
        mock.add_response("gpt-fast", Err(EndpointError::Transient("timeout".to_string())));
        mock.add_response("gpt-fast", ok_response(10, 5, 0));
        let dispatcher = Dispatcher::new(config(), pricing(), mock).unwrap();

        let result = dispatcher
            .submit_single("a".to_string(), "say {text}", None, None, None)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.error_kind, Some(ErrorKind::RetryExhausted));
    }

    #[tokio::test]
    async fn unknown_model_fails_at_construction() {
        let err = Dispatcher::new(
            DispatcherConfig::new("does-not-exist", "key", "https://api.example.com"),
            pricing(),
            MockChatEndpoint::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }
}
