use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use skjold::{with_retry, with_retry_and_timeout, ApiError, Result, RetryPolicy};

/// Async operation that fails N times then succeeds, counting calls.
struct FailThenSucceed {
    fail_count: AtomicU32,
    fail_with: fn(u32) -> ApiError,
    total_calls: AtomicU32,
}

impl FailThenSucceed {
    fn new(failures: u32, fail_with: fn(u32) -> ApiError) -> Arc<Self> {
        Arc::new(Self {
            fail_count: AtomicU32::new(failures),
            fail_with,
            total_calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.total_calls.load(Ordering::Relaxed)
    }

    async fn call(&self) -> Result<Value> {
        let call = self.total_calls.fetch_add(1, Ordering::Relaxed) + 1;
        let remaining = self.fail_count.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_count.fetch_sub(1, Ordering::Relaxed);
            return Err((self.fail_with)(call));
        }
        Ok(json!({"id": "42"}))
    }
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new()
        .max_retries(max_retries)
        .base_delay(Duration::from_millis(1))
        .jitter_ratio(0.0)
}

#[tokio::test(start_paused = true)]
async fn retries_transient_then_succeeds() {
    let op = FailThenSucceed::new(2, |_| ApiError::Server {
        status: 500,
        message: "boom".into(),
    });

    let result = with_retry(&fast_policy(3), "test", || op.call()).await;

    assert_eq!(result.unwrap(), json!({"id": "42"}));
    assert_eq!(op.call_count(), 3); // 2 failures + 1 success
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_last_error() {
    // Always fails; the error carries the attempt number so we can check
    // the surfaced error is exactly the final attempt's.
    let op = FailThenSucceed::new(u32::MAX, |call| ApiError::Server {
        status: 503,
        message: format!("attempt {call}"),
    });

    let result = with_retry(&fast_policy(3), "test", || op.call()).await;

    assert_eq!(op.call_count(), 4); // initial + 3 retries
    match result {
        Err(ApiError::Server { status, message }) => {
            assert_eq!(status, 503);
            assert_eq!(message, "attempt 4");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn terminal_error_is_not_retried() {
    let op = FailThenSucceed::new(1, |_| ApiError::Validation("bad input".into()));

    let result = with_retry(&fast_policy(5), "test", || op.call()).await;

    assert!(matches!(result, Err(ApiError::Validation(_))));
    assert_eq!(op.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_is_terminal() {
    let op = FailThenSucceed::new(1, |_| ApiError::Unauthorized);

    let result = with_retry(&fast_policy(5), "test", || op.call()).await;

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert_eq!(op.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn observer_runs_before_each_wait() {
    let op = FailThenSucceed::new(2, |_| ApiError::Network("reset".into()));
    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let policy = fast_policy(3).on_retry(move |attempt, _err| {
        seen_in.lock().unwrap().push(attempt);
    });

    let result = with_retry(&policy, "test", || op.call()).await;

    assert!(result.is_ok());
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn disabled_policy_single_attempt() {
    let op = FailThenSucceed::new(1, |_| ApiError::Network("reset".into()));

    let result = with_retry(&RetryPolicy::disabled(), "test", || op.call()).await;

    assert!(result.is_err());
    assert_eq!(op.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn custom_predicate_controls_retry() {
    // Only 500s retry; a 502 is terminal under this predicate.
    let policy = fast_policy(3).retry_on(|e| matches!(e, ApiError::Server { status: 500, .. }));
    let op = FailThenSucceed::new(5, |_| ApiError::Server {
        status: 502,
        message: "bad gateway".into(),
    });

    let result = with_retry(&policy, "test", || op.call()).await;

    assert!(result.is_err());
    assert_eq!(op.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_after_hint_overrides_backoff_wait() {
    let op = FailThenSucceed::new(1, |_| ApiError::RateLimited {
        retry_after: Some(Duration::from_millis(50)),
    });

    let start = tokio::time::Instant::now();
    let result = with_retry(&fast_policy(2), "test", || op.call()).await;

    assert!(result.is_ok());
    // Waited the server hint (50ms), not the 1ms backoff.
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn timeout_covers_entire_attempt_sequence() {
    // Backoff waits are 100ms, 200ms, ... — the 250ms deadline expires
    // mid-second-wait, well before retries are exhausted.
    let policy = RetryPolicy::new()
        .max_retries(10)
        .base_delay(Duration::from_millis(100))
        .jitter_ratio(0.0);
    let op = FailThenSucceed::new(u32::MAX, |_| ApiError::Network("down".into()));

    let result = with_retry_and_timeout(
        &policy,
        Some(Duration::from_millis(250)),
        "test",
        || op.call(),
    )
    .await;

    assert!(matches!(result, Err(ApiError::Timeout)));
    assert!(op.call_count() <= 3);
}

#[tokio::test(start_paused = true)]
async fn timeout_error_is_not_retryable() {
    // A timed-out operation handed back into retry logic must stop
    // immediately.
    let policy = fast_policy(5);
    assert!(!policy.is_retryable(&ApiError::Timeout));
}

#[tokio::test(start_paused = true)]
async fn end_to_end_backoff_scenario() {
    // Policy {max 2 retries, base 100ms, factor 2}: two 500s then success.
    // Expect 3 invocations, ~100ms + ~200ms of waiting, payload {id:"42"}.
    let policy = RetryPolicy::new()
        .max_retries(2)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(1))
        .backoff_factor(2.0)
        .jitter_ratio(0.0);
    let op = FailThenSucceed::new(2, |_| ApiError::Server {
        status: 500,
        message: "flaky".into(),
    });

    let start = tokio::time::Instant::now();
    let result = with_retry(&policy, "test", || op.call()).await;
    let elapsed = start.elapsed();

    assert_eq!(result.unwrap(), json!({"id": "42"}));
    assert_eq!(op.call_count(), 3);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(400));
}
