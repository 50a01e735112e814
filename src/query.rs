//! Subscription-style query and mutation wrappers.
//!
//! Thin policy layers over [`QueryCache`] mirroring the hook surface UI
//! code consumes: [`QueryHandle`] for list/detail reads, [`Mutation`] for
//! optimistic writes, [`PollingQuery`] for interval refresh, and
//! [`paginated_key`] for page-scoped keys.

use std::ops::Deref;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::warn;

use crate::cache::{
    run_optimistic, MutationState, OptimisticOptions, QueryCache, QueryConfig, QueryFn, QueryKey,
    QuerySnapshot, QueryStatus, QuerySubscription,
};
use crate::{ApiError, Result};

/// Live handle on one query: subscribes to the entry, kicks off the
/// initial fetch, and exposes the current snapshot plus `refetch`.
///
/// The `useQuery` analogue: `data()`, `status()`, `error()` read the
/// latest snapshot without suspending; [`changed`](Self::changed) awaits
/// the next one.
pub struct QueryHandle {
    cache: QueryCache,
    key: QueryKey,
    op: QueryFn,
    config: QueryConfig,
    sub: QuerySubscription,
}

impl QueryHandle {
    /// Subscribe to `key` and schedule the initial fetch.
    ///
    /// If cached data already exists the fetch is skipped unless
    /// `refetch_on_mount` is set, in which case a forced refetch runs.
    pub fn new(cache: &QueryCache, key: QueryKey, op: QueryFn, config: QueryConfig) -> Self {
        let sub = cache.subscribe(&key);
        let handle = Self {
            cache: cache.clone(),
            key,
            op,
            config,
            sub,
        };
        handle.spawn_initial_fetch();
        handle
    }

    fn spawn_initial_fetch(&self) {
        let has_data = self.cache.get_data(&self.key).is_some();
        let force = has_data && self.config.refetch_on_mount;
        if has_data && !force {
            return;
        }
        let cache = self.cache.clone();
        let key = self.key.clone();
        let op = self.op.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let result = if force {
                cache.refetch(&key, op, &config).await
            } else {
                cache.fetch(&key, op, &config).await
            };
            if let Err(err) = result {
                warn!(key = %key, error = %err, "initial fetch failed");
            }
        });
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest snapshot of the entry.
    pub fn snapshot(&self) -> QuerySnapshot {
        self.sub.snapshot()
    }

    pub fn data(&self) -> Option<Value> {
        self.sub.snapshot().data
    }

    pub fn status(&self) -> QueryStatus {
        self.sub.snapshot().status
    }

    pub fn error(&self) -> Option<ApiError> {
        self.sub.snapshot().error
    }

    /// Force a network refetch, resolving with the fresh result.
    pub async fn refetch(&self) -> Result<Value> {
        self.cache
            .refetch(&self.key, self.op.clone(), &self.config)
            .await
    }

    /// Wait for the next published snapshot. `None` if the entry was
    /// garbage-collected.
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        self.sub.changed().await
    }

    /// Wait until the query has settled: resolves with data once the entry
    /// holds any, or with the error once the entry is in error state.
    pub async fn ready(&mut self) -> Result<Value> {
        loop {
            let snap = self.sub.snapshot();
            match snap.status {
                QueryStatus::Fresh | QueryStatus::Stale => {
                    if let Some(data) = snap.data {
                        return Ok(data);
                    }
                }
                QueryStatus::Error => {
                    if let Some(err) = snap.error {
                        return Err(err);
                    }
                }
                QueryStatus::Pending => {}
            }
            if self.sub.changed().await.is_none() {
                return Err(ApiError::Network("cache entry dropped".into()));
            }
        }
    }
}

/// Reusable optimistic mutation with observable state.
///
/// The `useMutation` analogue: construct once, [`run`](Self::run) per
/// invocation. State transitions follow
/// `Idle → OptimisticApplied → Settled | RolledBack`.
pub struct Mutation {
    cache: QueryCache,
    op: QueryFn,
    options: OptimisticOptions,
    state_tx: watch::Sender<MutationState>,
}

impl Mutation {
    pub fn new(cache: &QueryCache, op: QueryFn, options: OptimisticOptions) -> Self {
        let (state_tx, _) = watch::channel(MutationState::Idle);
        Self {
            cache: cache.clone(),
            op,
            options,
            state_tx,
        }
    }

    /// Current state of the most recent invocation.
    pub fn state(&self) -> MutationState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<MutationState> {
        self.state_tx.subscribe()
    }

    /// Apply `apply` optimistically to `key`, run the mutation, reconcile.
    pub async fn run(
        &self,
        key: &QueryKey,
        apply: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value> {
        self.state_tx.send_replace(MutationState::OptimisticApplied);
        let result = run_optimistic(&self.cache, key, self.op.clone(), apply, &self.options).await;
        let settled = if result.is_ok() {
            MutationState::Settled
        } else {
            MutationState::RolledBack
        };
        self.state_tx.send_replace(settled);
        result
    }
}

/// Extend a base key with a page scope, for paginated and infinite lists.
///
/// Each page owns its cache entry; invalidating the base prefix drops the
/// whole list.
pub fn paginated_key(base: &QueryKey, page: u64, page_size: u64) -> QueryKey {
    base.clone()
        .push(json!({"page": page, "page_size": page_size}))
}

/// A [`QueryHandle`] that forces a refetch on a fixed interval while
/// alive. Dropping it stops the polling task; the subscription (and the
/// cache entry) detach as usual.
pub struct PollingQuery {
    handle: QueryHandle,
    task: tokio::task::JoinHandle<()>,
}

impl PollingQuery {
    pub fn new(
        cache: &QueryCache,
        key: QueryKey,
        op: QueryFn,
        config: QueryConfig,
        interval: Duration,
    ) -> Self {
        let handle = QueryHandle::new(cache, key.clone(), op.clone(), config.clone());
        let cache = cache.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the handle's initial fetch
            // already covers it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = cache.refetch(&key, op.clone(), &config).await {
                    warn!(key = %key, error = %err, "polling refetch failed");
                }
            }
        });
        Self { handle, task }
    }
}

impl Deref for PollingQuery {
    type Target = QueryHandle;

    fn deref(&self) -> &QueryHandle {
        &self.handle
    }
}

impl Drop for PollingQuery {
    fn drop(&mut self) {
        self.task.abort();
    }
}
