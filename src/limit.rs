//! Per-key sliding-window admission control.
//!
//! [`SlidingWindowLimiter`] counts requests per key within a moving time
//! window. A key that exceeds the window threshold transitions to a
//! BLOCKED state for a fixed block duration, during which every call is
//! denied without evaluating the window. Denial happens locally, before
//! any network activity, and surfaces as [`ApiError::RateLimitExceeded`]
//! at call sites.
//!
//! Three independently configured limiter instances cover the usual trust
//! levels — see [`RateLimiters`]. A key blocked in one tier has no effect
//! on another.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::telemetry;

type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

/// Configuration for one limiter instance.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests admitted per key within `time_window`.
    pub max_requests: usize,
    /// Width of the sliding window.
    pub time_window: Duration,
    /// How long a key stays blocked after exceeding the window.
    pub block_duration: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, time_window: Duration, block_duration: Duration) -> Self {
        Self {
            max_requests,
            time_window,
            block_duration,
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    /// Admission times within (roughly) the current window, oldest first.
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Keyed sliding-window rate limiter.
///
/// All methods are cheap and synchronous; the key map is guarded by a
/// single mutex and never held across an await point. [`remaining`] and
/// [`reset_in`] are pure probes — they never mutate state, so calling them
/// cannot perturb [`is_allowed`] decisions.
///
/// [`remaining`]: SlidingWindowLimiter::remaining
/// [`reset_in`]: SlidingWindowLimiter::reset_in
/// [`is_allowed`]: SlidingWindowLimiter::is_allowed
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    label: &'static str,
    keys: Mutex<HashMap<String, KeyState>>,
    clock: Clock,
}

impl SlidingWindowLimiter {
    /// Create a limiter using the system clock.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::labeled("default", config)
    }

    /// Create a limiter with a tier label used in metrics.
    pub fn labeled(label: &'static str, config: RateLimitConfig) -> Self {
        Self::with_clock(label, config, Instant::now)
    }

    /// Create a limiter with an injected clock. Intended for tests and
    /// simulation; production code uses [`SlidingWindowLimiter::new`].
    pub fn with_clock(
        label: &'static str,
        config: RateLimitConfig,
        clock: impl Fn() -> Instant + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            label,
            keys: Mutex::new(HashMap::new()),
            clock: Arc::new(clock),
        }
    }

    /// Admit or deny a request for `key`, recording it when admitted.
    ///
    /// While blocked, denies unconditionally (the window is not even
    /// evaluated). Otherwise prunes timestamps older than the window; if
    /// the pruned count has reached the threshold the key transitions to
    /// BLOCKED and the call is denied, else the current time is recorded
    /// and the call is admitted.
    pub fn is_allowed(&self, key: &str) -> bool {
        let now = (self.clock)();
        let mut keys = self.keys.lock().expect("limiter lock poisoned");
        let state = keys.entry(key.to_owned()).or_default();

        if let Some(until) = state.blocked_until {
            if now < until {
                self.count_denied();
                return false;
            }
            state.blocked_until = None;
        }

        let cutoff = now.checked_sub(self.config.time_window);
        while let Some(front) = state.timestamps.front() {
            match cutoff {
                Some(cutoff) if *front <= cutoff => {
                    state.timestamps.pop_front();
                }
                _ => break,
            }
        }

        if state.timestamps.len() >= self.config.max_requests {
            state.blocked_until = Some(now + self.config.block_duration);
            self.count_denied();
            return false;
        }

        state.timestamps.push_back(now);
        true
    }

    /// Requests still admissible for `key` in the current window.
    ///
    /// Read-only: recomputes the in-window count without pruning stored
    /// state or touching the blocked flag. Returns 0 while blocked.
    pub fn remaining(&self, key: &str) -> usize {
        let now = (self.clock)();
        let keys = self.keys.lock().expect("limiter lock poisoned");
        let Some(state) = keys.get(key) else {
            return self.config.max_requests;
        };
        if matches!(state.blocked_until, Some(until) if now < until) {
            return 0;
        }
        let in_window = self.in_window_count(state, now);
        self.config.max_requests.saturating_sub(in_window)
    }

    /// Time until `key` regains capacity.
    ///
    /// While blocked, the remainder of the block. Otherwise the time until
    /// the oldest in-window request slides out (zero when the window has
    /// room or no history exists). Read-only, like [`remaining`].
    ///
    /// [`remaining`]: SlidingWindowLimiter::remaining
    pub fn reset_in(&self, key: &str) -> Duration {
        let now = (self.clock)();
        let keys = self.keys.lock().expect("limiter lock poisoned");
        let Some(state) = keys.get(key) else {
            return Duration::ZERO;
        };
        if let Some(until) = state.blocked_until {
            if now < until {
                return until - now;
            }
        }
        if self.in_window_count(state, now) < self.config.max_requests {
            return Duration::ZERO;
        }
        state
            .timestamps
            .iter()
            .find(|t| !self.is_outside_window(**t, now))
            .map(|oldest| (*oldest + self.config.time_window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Seconds until `key` regains capacity. Convenience over
    /// [`reset_in`](SlidingWindowLimiter::reset_in).
    pub fn reset_seconds(&self, key: &str) -> f64 {
        self.reset_in(key).as_secs_f64()
    }

    /// Forget all state for `key` (window history and any block).
    pub fn reset(&self, key: &str) {
        self.keys.lock().expect("limiter lock poisoned").remove(key);
    }

    /// Forget all state for every key.
    pub fn reset_all(&self) {
        self.keys.lock().expect("limiter lock poisoned").clear();
    }

    fn in_window_count(&self, state: &KeyState, now: Instant) -> usize {
        state
            .timestamps
            .iter()
            .filter(|t| !self.is_outside_window(**t, now))
            .count()
    }

    fn is_outside_window(&self, t: Instant, now: Instant) -> bool {
        match now.checked_sub(self.config.time_window) {
            Some(cutoff) => t <= cutoff,
            None => false,
        }
    }

    fn count_denied(&self) {
        metrics::counter!(telemetry::RATE_LIMITED_TOTAL, "tier" => self.label).increment(1);
    }
}

/// Limiter tier selector, used in per-query configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterTier {
    /// Lenient default for miscellaneous calls.
    General,
    /// Stricter limit for generic API endpoints.
    Api,
    /// Strictest limit for authentication endpoints.
    Auth,
}

/// The three standard limiter instances, one per trust level.
///
/// Independent keyed stores: a key blocked in `auth` says nothing about
/// the same key in `api` or `general`.
pub struct RateLimiters {
    pub general: SlidingWindowLimiter,
    pub api: SlidingWindowLimiter,
    pub auth: SlidingWindowLimiter,
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self {
            general: SlidingWindowLimiter::labeled(
                "general",
                RateLimitConfig::new(100, Duration::from_secs(60), Duration::from_secs(60)),
            ),
            api: SlidingWindowLimiter::labeled(
                "api",
                RateLimitConfig::new(30, Duration::from_secs(60), Duration::from_secs(120)),
            ),
            // Smallest window, longest block: failed-login hammering should
            // lock the key out for a while.
            auth: SlidingWindowLimiter::labeled(
                "auth",
                RateLimitConfig::new(5, Duration::from_secs(30), Duration::from_secs(300)),
            ),
        }
    }
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build with explicit per-tier configurations.
    pub fn with_configs(
        general: RateLimitConfig,
        api: RateLimitConfig,
        auth: RateLimitConfig,
    ) -> Self {
        Self {
            general: SlidingWindowLimiter::labeled("general", general),
            api: SlidingWindowLimiter::labeled("api", api),
            auth: SlidingWindowLimiter::labeled("auth", auth),
        }
    }

    pub fn tier(&self, tier: LimiterTier) -> &SlidingWindowLimiter {
        match tier {
            LimiterTier::General => &self.general,
            LimiterTier::Api => &self.api,
            LimiterTier::Auth => &self.auth,
        }
    }
}
