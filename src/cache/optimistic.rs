//! Optimistic mutation coordinator.
//!
//! "Apply now, reconcile later": the predicted result of a mutation is
//! written to the cache before the network call resolves, so every
//! subscriber sees the change immediately. On success the key is
//! invalidated and the next read reconciles with server truth; on failure
//! the pre-mutation snapshot is restored verbatim and the error surfaces
//! to the caller with its classification intact.
//!
//! Rollback uses a generation guard: the coordinator captures the entry
//! generation right after its optimistic write and restores the snapshot
//! only if the generation is unchanged at failure time. If another writer
//! (a second optimistic mutation, `set_data`, or a completed fetch) got
//! there first, the stale rollback is dropped rather than clobbering the
//! newer value.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use super::{QueryCache, QueryFn, QueryKey};
use crate::retry::{with_retry_and_timeout, RetryPolicy};
use crate::telemetry;
use crate::Result;

/// Lifecycle of a single optimistic mutation invocation.
///
/// `Idle → OptimisticApplied → Settled` on success,
/// `Idle → OptimisticApplied → RolledBack` on failure. No further
/// transitions happen for that invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Idle,
    OptimisticApplied,
    Settled,
    RolledBack,
}

/// Configuration for [`run_optimistic`].
#[derive(Debug, Clone)]
pub struct OptimisticOptions {
    /// Retry policy for the mutation itself. Mutations are not assumed
    /// idempotent, so the default performs a single attempt.
    pub retry: RetryPolicy,
    /// Deadline over the whole mutation (all attempts).
    pub timeout: Option<Duration>,
    /// Invalidate the key after a successful mutation so the next read
    /// reconciles with the server. Default: true.
    pub invalidate_on_success: bool,
    /// Surface one user-visible notification on terminal failure.
    /// Default: true.
    pub notify_on_error: bool,
}

impl Default for OptimisticOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::disabled(),
            timeout: None,
            invalidate_on_success: true,
            notify_on_error: true,
        }
    }
}

impl OptimisticOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    pub fn invalidate_on_success(mut self, on: bool) -> Self {
        self.invalidate_on_success = on;
        self
    }

    pub fn notify_on_error(mut self, on: bool) -> Self {
        self.notify_on_error = on;
        self
    }
}

/// Run `mutation` with optimistic cache semantics for `key`.
///
/// Protocol: pause background refreshes for the key, snapshot the current
/// value, apply `apply(current)` to the cache (one synchronous step — no
/// subscriber ever observes a partially-applied intermediate), run the
/// mutation through the retry executor, then either invalidate on success
/// or restore the snapshot on failure. The snapshot and the optimistic
/// write happen in a single critical section, and the restore is
/// bit-for-bit the pre-mutation value.
pub async fn run_optimistic(
    cache: &QueryCache,
    key: &QueryKey,
    mutation: QueryFn,
    apply: impl FnOnce(Option<Value>) -> Value,
    options: &OptimisticOptions,
) -> Result<Value> {
    cache.pause_refresh(key);
    let (previous, guard_generation) = cache.apply_optimistic(key, apply);
    debug!(key = %key, state = ?MutationState::OptimisticApplied, "optimistic apply");

    let result =
        with_retry_and_timeout(&options.retry, options.timeout, "mutation", || mutation()).await;

    match &result {
        Ok(_) => {
            cache.resume_refresh(key);
            if options.invalidate_on_success {
                cache.invalidate(key);
            }
            debug!(key = %key, state = ?MutationState::Settled, "mutation settled");
        }
        Err(err) => {
            let rolled_back = cache.restore_if_unchanged(key, guard_generation, previous);
            cache.resume_refresh(key);
            if rolled_back {
                metrics::counter!(telemetry::OPTIMISTIC_ROLLBACKS_TOTAL).increment(1);
            }
            if options.notify_on_error {
                cache.notify_terminal_error(err);
            }
            debug!(
                key = %key,
                state = ?MutationState::RolledBack,
                rolled_back,
                error = %err,
                "mutation failed"
            );
        }
    }
    result
}
