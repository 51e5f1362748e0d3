//! Append-only statistics accumulation with per-batch scoping by snapshot diff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::pricing::PricingEntry;
use crate::request::ErrorKind;

/// Accumulated counters. The global instance lives for the dispatcher's
/// lifetime; per-batch values are obtained by differencing two snapshots.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,

    pub cost_sum: f64,
    pub cost_by_model: HashMap<String, f64>,

    pub response_time_min: Option<Duration>,
    pub response_time_max: Option<Duration>,
    pub response_time_sum: Duration,

    pub wait_time_sum: Duration,
    pub retry_count: u64,

    pub concurrency_peak: usize,

    pub error_kind_counts: HashMap<ErrorKind, u64>,
    pub api_rate_limits_detected: u64,

    pub processing_time_sum: Duration,
}

impl Stats {
    /// Componentwise difference `self - other`, used to scope a batch's
    /// contribution out of the running global total.
    fn diff(&self, earlier: &Stats) -> Stats {
        let mut cost_by_model = HashMap::new();
        for (model, cost) in &self.cost_by_model {
            let earlier_cost = earlier.cost_by_model.get(model).copied().unwrap_or(0.0);
            cost_by_model.insert(model.clone(), cost - earlier_cost);
        }

        let mut error_kind_counts = HashMap::new();
        for (kind, count) in &self.error_kind_counts {
            let earlier_count = earlier.error_kind_counts.get(kind).copied().unwrap_or(0);
            error_kind_counts.insert(*kind, count - earlier_count);
        }

        Stats {
            total_requests: self.total_requests - earlier.total_requests,
            successful_requests: self.successful_requests - earlier.successful_requests,
            failed_requests: self.failed_requests - earlier.failed_requests,
            input_tokens: self.input_tokens - earlier.input_tokens,
            output_tokens: self.output_tokens - earlier.output_tokens,
            cached_tokens: self.cached_tokens - earlier.cached_tokens,
            cost_sum: self.cost_sum - earlier.cost_sum,
            cost_by_model,
            response_time_min: self.response_time_min,
            response_time_max: self.response_time_max,
            response_time_sum: self.response_time_sum.saturating_sub(earlier.response_time_sum),
            wait_time_sum: self.wait_time_sum.saturating_sub(earlier.wait_time_sum),
            retry_count: self.retry_count - earlier.retry_count,
            // concurrency_peak is set separately by the batch handle, not diffed.
            concurrency_peak: 0,
            error_kind_counts,
            api_rate_limits_detected: self.api_rate_limits_detected - earlier.api_rate_limits_detected,
            processing_time_sum: self.processing_time_sum.saturating_sub(earlier.processing_time_sum),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn avg_response_time(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        self.response_time_sum / self.total_requests as u32
    }

    pub fn avg_rate(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }
        self.total_requests as f64 / elapsed.as_secs_f64()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let denom = self.input_tokens + self.cached_tokens;
        if denom == 0 {
            return 0.0;
        }
        self.cached_tokens as f64 / denom as f64
    }

    /// What cached tokens saved versus paying the full input price for them.
    pub fn cost_savings_from_cache(&self, pricing: &PricingEntry) -> f64 {
        (self.cached_tokens as f64 / 1000.0) * (pricing.input - pricing.cache)
    }

    pub fn efficiency_rate(&self) -> f64 {
        if self.processing_time_sum.is_zero() {
            return 0.0;
        }
        let useful = self.processing_time_sum.saturating_sub(self.wait_time_sum);
        useful.as_secs_f64() / self.processing_time_sum.as_secs_f64()
    }
}

/// Handle returned by [`StatsManager::start_batch`], closed by
/// [`StatsManager::end_batch`].
pub struct BatchHandle {
    pub batch_id: String,
    pub start_time: Instant,
    snapshot: Stats,
}

/// Owns the process-wide [`Stats`] instance and the live concurrency
/// counter. Mutations happen only from request-completion handlers; a
/// single mutex guards the counters (so a preemptive port stays correct),
/// and the live/peak concurrency counters use atomics since they are
/// updated far more often than they are read.
pub struct StatsManager {
    stats: Mutex<Stats>,
    concurrent_live: AtomicUsize,
    max_concurrent_limit: usize,
    batch_peak: AtomicUsize,
}

impl StatsManager {
    pub fn new(max_concurrent_limit: usize) -> Self {
        Self {
            stats: Mutex::new(Stats::default()),
            concurrent_live: AtomicUsize::new(0),
            max_concurrent_limit,
            batch_peak: AtomicUsize::new(0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_request(
        &self,
        success: bool,
        input_tokens: u32,
        output_tokens: u32,
        cached_tokens: u32,
        cost: f64,
        api_response_time: Duration,
        error_kind: Option<ErrorKind>,
        retry_count: u32,
        api_rate_limit_detected: bool,
        coordinated_wait_time: Duration,
        model: &str,
    ) {
        let mut stats = self.stats.lock();
        stats.total_requests += 1;
        if success {
            stats.successful_requests += 1;
        } else {
            stats.failed_requests += 1;
        }

        stats.input_tokens += input_tokens as u64;
        stats.output_tokens += output_tokens as u64;
        stats.cached_tokens += cached_tokens as u64;
        stats.cost_sum += cost;
        *stats.cost_by_model.entry(model.to_string()).or_insert(0.0) += cost;

        stats.response_time_min = Some(match stats.response_time_min {
            Some(min) => min.min(api_response_time),
            None => api_response_time,
        });
        stats.response_time_max = Some(match stats.response_time_max {
            Some(max) => max.max(api_response_time),
            None => api_response_time,
        });
        stats.response_time_sum += api_response_time;

        stats.wait_time_sum += coordinated_wait_time;
        stats.retry_count += retry_count as u64;

        if let Some(kind) = error_kind {
            *stats.error_kind_counts.entry(kind).or_insert(0) += 1;
        }
        if api_rate_limit_detected {
            stats.api_rate_limits_detected += 1;
        }
    }

    pub fn add_processing_time(&self, duration: Duration) {
        self.stats.lock().processing_time_sum += duration;
    }

    /// Increment the live concurrency counter, clamped at the configured
    /// cap, and update the running and batch-scoped peaks.
    pub fn record_concurrent_start(&self) {
        let live = self.concurrent_live.fetch_add(1, Ordering::SeqCst) + 1;
        let clamped = live.min(self.max_concurrent_limit);

        {
            let mut stats = self.stats.lock();
            stats.concurrency_peak = stats.concurrency_peak.max(clamped);
        }
        self.batch_peak.fetch_max(clamped, Ordering::SeqCst);
    }

    pub fn record_concurrent_end(&self) {
        self.concurrent_live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live_concurrency(&self) -> usize {
        self.concurrent_live.load(Ordering::SeqCst)
    }

    pub fn start_batch(&self, batch_id: impl Into<String>) -> BatchHandle {
        self.batch_peak.store(0, Ordering::SeqCst);
        BatchHandle {
            batch_id: batch_id.into(),
            start_time: Instant::now(),
            snapshot: self.stats.lock().clone(),
        }
    }

    pub fn end_batch(&self, handle: BatchHandle) -> Stats {
        let current = self.stats.lock().clone();
        let mut batch_stats = current.diff(&handle.snapshot);
        batch_stats.concurrency_peak = self.batch_peak.load(Ordering::SeqCst);
        batch_stats
    }

    pub fn global_stats(&self) -> Stats {
        self.stats.lock().clone()
    }

    pub fn reset(&self) {
        *self.stats.lock() = Stats::default();
        self.batch_peak.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_keeps_success_and_failure_consistent() {
        let manager = StatsManager::new(10);
        manager.record_request(
            true, 40, 20, 10, 0.000_085, Duration::from_millis(100), None, 0, false,
            Duration::ZERO, "gpt-fast",
        );
        manager.record_request(
            false, 0, 0, 0, 0.0, Duration::from_millis(50), Some(ErrorKind::PermanentApiError),
            2, false, Duration::ZERO, "gpt-fast",
        );

        let stats = manager.global_stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests + stats.failed_requests, stats.total_requests);
    }

    #[test]
    fn batches_sum_to_global_difference() {
        let manager = StatsManager::new(10);
        let handle1 = manager.start_batch("batch-1");
        manager.record_request(
            true, 40, 20, 10, 0.000_085, Duration::from_millis(10), None, 0, false,
            Duration::ZERO, "m",
        );
        let batch1 = manager.end_batch(handle1);

        let handle2 = manager.start_batch("batch-2");
        manager.record_request(
            true, 40, 20, 10, 0.000_085, Duration::from_millis(10), None, 0, false,
            Duration::ZERO, "m",
        );
        let batch2 = manager.end_batch(handle2);

        let global = manager.global_stats();
        assert_eq!(batch1.total_requests + batch2.total_requests, global.total_requests);
        assert!((batch1.cost_sum + batch2.cost_sum - global.cost_sum).abs() < 1e-9);
    }

    #[test]
    fn concurrency_peak_is_clamped_at_limit() {
        let manager = StatsManager::new(2);
        manager.record_concurrent_start();
        manager.record_concurrent_start();
        manager.record_concurrent_start();
        assert_eq!(manager.global_stats().concurrency_peak, 2);
    }

    #[test]
    fn cache_hit_rate_matches_spec_example() {
        let manager = StatsManager::new(10);
        for _ in 0..3 {
            manager.record_request(
                true, 50, 20, 10, 0.000_085, Duration::from_millis(10), None, 0, false,
                Duration::ZERO, "m",
            );
        }
        let stats = manager.global_stats();
        assert!((stats.cache_hit_rate() - 10.0 / 60.0).abs() < 1e-9);
        assert!((stats.cost_sum - 0.000_255).abs() < 1e-9);
    }
}
