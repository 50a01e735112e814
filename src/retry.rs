//! Retry policy, backoff calculation, and the retry executor.
//!
//! Provides [`RetryPolicy`] for controlling retry behaviour and the
//! [`with_retry`] / [`with_retry_and_timeout`] helpers that wrap a single
//! async operation with bounded retry. All retrying layers (foreground
//! fetches, background refreshes, mutations) delegate here, keeping retry
//! logic in a single place.
//!
//! Backoff is exponential with multiplicative jitter:
//! `raw = min(base_delay * backoff_factor^attempt, max_delay)`, then
//! `raw + raw * jitter_ratio * U(0,1)`. Multiplicative (rather than full)
//! jitter keeps the delay roughly proportional to the backoff curve while
//! desynchronizing concurrent retries. The delay calculation is pure given
//! the unit sample, so tests can pin it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::telemetry;
use crate::{ApiError, Result};

/// Predicate deciding whether an error is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// Observer invoked before each retry wait with `(attempt_number, error)`.
///
/// `attempt_number` is 1-based (1 = first retry). Intended for logging and
/// metrics only — it cannot alter control flow.
pub type RetryObserver = Arc<dyn Fn(u32, &ApiError) + Send + Sync>;

/// Configuration for retry behaviour on transient errors.
///
/// Builder-style, with sensible defaults:
///
/// ```rust
/// # use skjold::RetryPolicy;
/// # use std::time::Duration;
/// let policy = RetryPolicy::new()
///     .max_retries(5)
///     .base_delay(Duration::from_millis(200))
///     .jitter_ratio(0.2);
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    /// 0 = single attempt, no retry. Default: 3.
    pub max_retries: u32,
    /// Base delay before the first retry. Default: 1s.
    pub base_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    pub max_delay: Duration,
    /// Multiplier applied per attempt. Must be > 1 to actually back off.
    /// Default: 2.0.
    pub backoff_factor: f64,
    /// Jitter as a fraction of the raw delay, in `[0, 1]`. Default: 0.1.
    pub jitter_ratio: f64,
    retry_on: Option<RetryPredicate>,
    on_retry: Option<RetryObserver>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "<predicate>"))
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter_ratio: 0.1,
            retry_on: None,
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a policy that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the maximum number of retries after the initial attempt.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the per-attempt backoff multiplier.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the jitter fraction. Clamped to `[0, 1]`.
    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Override the retryable predicate. Without this, errors retry iff
    /// [`ApiError::is_transient`] holds.
    pub fn retry_on(mut self, predicate: impl Fn(&ApiError) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Attach an observer called before each retry wait.
    pub fn on_retry(mut self, observer: impl Fn(u32, &ApiError) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Whether the policy considers `err` retryable.
    pub fn is_retryable(&self, err: &ApiError) -> bool {
        match &self.retry_on {
            Some(predicate) => predicate(err),
            None => err.is_transient(),
        }
    }

    /// Raw backoff delay for a given attempt number (0-indexed), without
    /// jitter: `min(base_delay * backoff_factor^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Backoff delay with multiplicative jitter applied.
    ///
    /// Pure given `unit_sample ∈ [0, 1)`; [`with_retry`] feeds
    /// `fastrand::f64()`. The result lies in
    /// `[raw, raw * (1 + jitter_ratio)]`.
    pub fn jittered_delay(&self, attempt: u32, unit_sample: f64) -> Duration {
        let raw = self.delay_for_attempt(attempt);
        raw + raw.mul_f64(self.jitter_ratio * unit_sample.clamp(0.0, 1.0))
    }

    /// The delay actually slept before the next attempt.
    ///
    /// A server `retry_after` hint (from a `RateLimited` error) takes
    /// precedence over the computed backoff.
    pub fn effective_delay(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        unit_sample: f64,
    ) -> Duration {
        retry_after.unwrap_or_else(|| self.jittered_delay(attempt, unit_sample))
    }
}

/// Execute an async operation with retry logic.
///
/// Retries errors the policy classifies as retryable, up to
/// `policy.max_retries` additional attempts, sleeping the jittered backoff
/// between attempts (a cancellable `tokio::time::sleep`). Terminal errors
/// return immediately; when attempts are exhausted, the error from the
/// *last* attempt is returned verbatim — never wrapped — so the caller can
/// still branch on its kind.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !policy.is_retryable(&err) {
                    return Err(err);
                }
                metrics::counter!(telemetry::RETRIES_TOTAL, "operation" => operation.to_owned())
                    .increment(1);
                let delay = policy.effective_delay(attempt, err.retry_after(), fastrand::f64());
                if let Some(observer) = &policy.on_retry {
                    observer(attempt + 1, &err);
                }
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Bound a future with an overall wall-clock deadline.
///
/// On expiry the future is dropped (cancelling any in-flight attempt or
/// backoff sleep) and [`ApiError::Timeout`] is returned. `Timeout` is not
/// transient, so a timed-out operation never re-enters retry logic.
pub async fn with_timeout<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::Timeout),
    }
}

/// Retry with an optional deadline over the *entire* attempt sequence.
///
/// The deadline covers every attempt plus every backoff sleep, not each
/// attempt individually.
pub async fn with_retry_and_timeout<F, Fut, T>(
    policy: &RetryPolicy,
    limit: Option<Duration>,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => with_timeout(limit, with_retry(policy, operation, f)).await,
        None => with_retry(policy, operation, f).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .backoff_factor(2.0)
            .jitter_ratio(0.1)
    }

    #[test]
    fn backoff_grows_exponentially_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(800));
        // capped from here on
        assert_eq!(p.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn jittered_delay_within_bounds() {
        let p = policy();
        for attempt in 0..=10 {
            let raw = p.delay_for_attempt(attempt);
            let upper = raw + raw.mul_f64(p.jitter_ratio);
            for sample in [0.0, 0.25, 0.5, 0.999] {
                let d = p.jittered_delay(attempt, sample);
                assert!(d >= raw, "attempt {attempt}: {d:?} < {raw:?}");
                assert!(d <= upper, "attempt {attempt}: {d:?} > {upper:?}");
            }
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let p = policy().jitter_ratio(0.0);
        assert_eq!(p.jittered_delay(2, 0.7), p.delay_for_attempt(2));
    }

    #[test]
    fn retry_after_hint_overrides_backoff() {
        let p = policy();
        let hint = Some(Duration::from_millis(5));
        assert_eq!(p.effective_delay(3, hint, 0.5), Duration::from_millis(5));
        assert_eq!(p.effective_delay(0, None, 0.0), Duration::from_millis(100));
    }

    #[test]
    fn jitter_ratio_is_clamped() {
        let p = RetryPolicy::new().jitter_ratio(3.0);
        assert_eq!(p.jitter_ratio, 1.0);
        let p = RetryPolicy::new().jitter_ratio(-1.0);
        assert_eq!(p.jitter_ratio, 0.0);
    }

    #[test]
    fn custom_predicate_wins_over_default() {
        let p = RetryPolicy::new().retry_on(|e| matches!(e, ApiError::Timeout));
        assert!(p.is_retryable(&ApiError::Timeout));
        assert!(!p.is_retryable(&ApiError::Network("x".into())));
    }
}
