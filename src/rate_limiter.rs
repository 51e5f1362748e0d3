//! Adaptive rate limiter: proactive TPM gate, calibration, coordinated pause.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;

const DEFAULT_F_MIN: f64 = 0.3;
const DEFAULT_F_MAX: f64 = 3.0;
const RING_CAPACITY: usize = 1000;
const RECALIBRATION_INTERVAL: Duration = Duration::from_secs(300);
const LOG_DELTA_THRESHOLD: f64 = 0.05;
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// One observed `(estimate, actual)` pair used to drive calibration.
#[derive(Debug, Clone, Copy)]
struct TokenUsageRecord {
    estimate: u32,
    actual: u32,
    #[allow(dead_code)]
    timestamp: Instant,
    ratio: f64,
}

/// State protected by the token lock: the rolling TPM window and
/// calibration factor.
struct TokenState {
    tokens_used_this_minute: u32,
    minute_start: Instant,
    calibration_factor: f64,
    history: VecDeque<TokenUsageRecord>,
    last_recalibration: Instant,
}

/// State protected by the pause lock: the coordinated pause and its
/// associated event counters.
struct PauseState {
    paused_until: Option<Instant>,
    api_rate_limits_detected: u64,
    rate_limit_event_active: bool,
}

/// Single-process gate enforcing a rolling tokens-per-minute budget,
/// calibrating its own token estimates, and coordinating a fleet-wide pause
/// when the server signals a rate limit.
///
/// Two locks guard disjoint state (`pause_lock` then `token_lock` when both
/// are needed, never the reverse) so `acquire` can consult the pause state
/// without contending with in-flight TPM bookkeeping.
pub struct AdaptiveRateLimiter {
    max_tpm: u32,
    adaptive: bool,
    f_min: f64,
    f_max: f64,
    pause_lock: Mutex<PauseState>,
    token_lock: Mutex<TokenState>,
    retry_after_regex: Regex,
}

impl AdaptiveRateLimiter {
    pub fn new(max_tpm: u32, adaptive_calibration: bool) -> Self {
        let now = Instant::now();
        Self {
            max_tpm,
            adaptive: adaptive_calibration,
            f_min: DEFAULT_F_MIN,
            f_max: DEFAULT_F_MAX,
            pause_lock: Mutex::new(PauseState {
                paused_until: None,
                api_rate_limits_detected: 0,
                rate_limit_event_active: false,
            }),
            token_lock: Mutex::new(TokenState {
                tokens_used_this_minute: 0,
                minute_start: now,
                calibration_factor: 1.0,
                history: VecDeque::with_capacity(RING_CAPACITY),
                last_recalibration: now,
            }),
            // Matches "retry after N seconds", "wait N seconds", "30s" etc.
            retry_after_regex: Regex::new(
                r"(?i)(?:retry after|wait)\s+(\d+)\s*seconds?|(\d+)\s*s\b",
            )
            .expect("static regex is valid"),
        }
    }

    /// Proactively gate a call estimated to use `estimate` tokens. Sleeps
    /// through any active coordinated pause, then through any proactive
    /// TPM overrun, then returns the calibrated estimate actually reserved
    /// together with the total time this call spent asleep (fed into the
    /// stats manager's `coordinated_wait_time` so `efficiency_rate` reflects
    /// real pause/backpressure time rather than always reading 1.0).
    pub async fn acquire(&self, estimate: u32) -> (u32, Duration) {
        let mut waited = self.wait_out_pause().await;

        let calibrated = self.calibrated_estimate(estimate);

        loop {
            let wait = {
                let mut state = self.token_lock.lock();
                let now = Instant::now();
                if now.duration_since(state.minute_start) >= Duration::from_secs(60) {
                    state.tokens_used_this_minute = 0;
                    state.minute_start = now;
                }
                if state.tokens_used_this_minute + calibrated > self.max_tpm {
                    let elapsed = now.duration_since(state.minute_start);
                    Some(Duration::from_secs(60).saturating_sub(elapsed))
                } else {
                    state.tokens_used_this_minute += calibrated;
                    None
                }
            };

            match wait {
                None => break,
                Some(wait) => {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                        waited += wait;
                    }
                    let mut state = self.token_lock.lock();
                    state.tokens_used_this_minute = 0;
                    state.minute_start = Instant::now();
                }
            }
        }

        (calibrated, waited)
    }

    fn calibrated_estimate(&self, estimate: u32) -> u32 {
        if !self.adaptive {
            return estimate;
        }
        let f = self.token_lock.lock().calibration_factor;
        ((estimate as f64) * f).round().max(0.0) as u32
    }

    /// Record the outcome of a completed call for calibration purposes.
    /// Also clears the "rate limit event active" flag.
    pub fn record_tokens(&self, estimate: u32, actual: u32) {
        {
            let mut pause = self.pause_lock.lock();
            pause.rate_limit_event_active = false;
        }

        if !self.adaptive || estimate == 0 {
            return;
        }

        let ratio = actual as f64 / estimate as f64;
        let mut state = self.token_lock.lock();
        if state.history.len() == RING_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(TokenUsageRecord {
            estimate,
            actual,
            timestamp: Instant::now(),
            ratio,
        });

        let due = Instant::now().duration_since(state.last_recalibration) >= RECALIBRATION_INTERVAL;
        if due {
            self.recalibrate(&mut state);
        }
    }

    fn recalibrate(&self, state: &mut TokenState) {
        if state.history.is_empty() {
            state.last_recalibration = Instant::now();
            return;
        }

        let weighted_mean_ratio =
            state.history.iter().map(|r| r.ratio).sum::<f64>() / state.history.len() as f64;

        let old_f = state.calibration_factor;
        let new_f = (0.6 * weighted_mean_ratio + 0.4 * old_f).clamp(self.f_min, self.f_max);

        if (new_f - old_f).abs() > LOG_DELTA_THRESHOLD {
            tracing::info!(old_f, new_f, weighted_mean_ratio, "rate limiter recalibrated");
        }

        state.calibration_factor = new_f;
        state.last_recalibration = Instant::now();
    }

    /// Install (or extend) the coordinated pause. Synchronous: the pause is
    /// visible to every subsequent `acquire` call the instant this returns,
    /// closing the slip-through window a background-task install would
    /// leave open.
    pub fn record_api_rate_limit(&self, wait_time: Duration) {
        let mut pause = self.pause_lock.lock();
        let now = Instant::now();
        let candidate = now + wait_time;

        let should_extend = match pause.paused_until {
            Some(until) => candidate > until,
            None => true,
        };

        if should_extend {
            let was_paused = pause.paused_until.is_some();
            pause.paused_until = Some(candidate);
            if !was_paused {
                tracing::warn!(wait_secs = wait_time.as_secs_f64(), "coordinated pause started");
            }
        }

        pause.api_rate_limits_detected += 1;
        pause.rate_limit_event_active = true;
    }

    pub fn api_rate_limits_detected(&self) -> u64 {
        self.pause_lock.lock().api_rate_limits_detected
    }

    pub fn is_paused(&self) -> bool {
        match self.pause_lock.lock().paused_until {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Sleep through any active coordinated pause, returning how long this
    /// call slept.
    async fn wait_out_pause(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let remaining = {
                let pause = self.pause_lock.lock();
                match pause.paused_until {
                    Some(until) if Instant::now() < until => Some(until - Instant::now()),
                    _ => None,
                }
            };

            match remaining {
                None => {
                    let mut pause = self.pause_lock.lock();
                    if pause.paused_until.is_some() {
                        pause.paused_until = None;
                        tracing::info!("coordinated pause ended");
                    }
                    break;
                }
                Some(remaining) => {
                    tokio::time::sleep(remaining).await;
                    waited += remaining;
                }
            }
        }
        waited
    }

    /// Best-effort wait-time extraction from a failed call:
    /// structured `retry_after`, then a regex over the error message, then
    /// a 60-second default.
    pub fn parse_wait_time(&self, retry_after: Option<Duration>, message: &str) -> Duration {
        if let Some(duration) = retry_after {
            return duration;
        }

        if let Some(captures) = self.retry_after_regex.captures(message) {
            let seconds = captures
                .get(1)
                .or_else(|| captures.get(2))
                .and_then(|m| m.as_str().parse::<u64>().ok());
            if let Some(seconds) = seconds {
                return Duration::from_secs(seconds);
            }
        }

        DEFAULT_RATE_LIMIT_WAIT
    }
}
