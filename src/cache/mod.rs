//! Process-wide query/mutation cache.
//!
//! [`QueryCache`] is a keyed store of fetched results with staleness and
//! garbage-collection timers. A `fetch` on a fresh entry is served from
//! memory with no network call; a stale entry with active subscribers is
//! served immediately while a background refresh reconciles it
//! (stale-while-revalidate); an absent or expired entry triggers a
//! blocking fetch. At most one network fetch per key is in flight at any
//! instant — concurrent callers attach to the same in-flight operation.
//!
//! # Architecture
//!
//! The cache sits above the retry executor: every network fetch it issues
//! runs under [`with_retry_and_timeout`](crate::retry::with_retry_and_timeout),
//! and each attempt passes the configured rate-limiter gate before touching
//! the transport. Subscribers observe entries through `tokio::sync::watch`
//! channels; an entry's subscriber refcount drives both the
//! stale-while-revalidate decision and garbage collection.
//!
//! # Lock discipline
//!
//! The key→entry map is the only shared mutable state, guarded by a single
//! mutex that is never held across an await point. Every read-modify-write
//! of an entry happens inside one synchronous critical section.

pub mod key;
mod optimistic;

pub use key::QueryKey;
pub use optimistic::{run_optimistic, MutationState, OptimisticOptions};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::limit::{LimiterTier, RateLimiters};
use crate::retry::{with_retry_and_timeout, RetryPolicy};
use crate::telemetry;
use crate::transport::{Notifier, TracingNotifier};
use crate::{ApiError, Result};

/// An opaque asynchronous operation producing a JSON payload.
///
/// Stored per entry so invalidation and the maintenance timer can refresh
/// a key without the original caller being around.
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async closure into a [`QueryFn`].
pub fn query_fn<F, Fut>(f: F) -> QueryFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// No data yet; a fetch may be in flight.
    Pending,
    /// Data present and not yet stale.
    Fresh,
    /// Data present and returnable, but eligible for background refresh.
    Stale,
    /// The last foreground fetch failed and no usable data exists.
    Error,
}

/// Point-in-time view of an entry, delivered to subscribers.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<ApiError>,
}

impl QuerySnapshot {
    fn pending() -> Self {
        Self {
            status: QueryStatus::Pending,
            data: None,
            error: None,
        }
    }
}

/// Per-query configuration.
///
/// Defaults mirror a conservative dashboard profile: data is fresh for
/// five minutes, kept for ten more after going stale, refetched on
/// reconnect but not on focus or mount, and retried once.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long fetched data counts as fresh. Default: 5 minutes.
    pub stale_time: Duration,
    /// How long an unreferenced entry is kept after going stale before
    /// garbage collection may remove it. Default: 10 minutes.
    pub gc_time: Duration,
    /// Retry policy for fetches issued by this query. Default: 1 retry.
    pub retry: RetryPolicy,
    /// Deadline over the whole fetch (all attempts and backoff waits).
    pub timeout: Option<Duration>,
    /// Admission gate checked before every attempt: `(tier, limiter key)`.
    pub rate_limit: Option<(LimiterTier, String)>,
    /// Refetch when a handle is created even though data exists. Default: false.
    pub refetch_on_mount: bool,
    /// Refetch subscribed entries on [`QueryCache::notify_reconnect`]. Default: true.
    pub refetch_on_reconnect: bool,
    /// Refetch subscribed entries on [`QueryCache::notify_focus`]. Default: false.
    pub refetch_on_focus: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(300),
            gc_time: Duration::from_secs(600),
            retry: RetryPolicy::new().max_retries(1),
            timeout: None,
            rate_limit: None,
            refetch_on_mount: false,
            refetch_on_reconnect: true,
            refetch_on_focus: false,
        }
    }
}

impl QueryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stale_time(mut self, d: Duration) -> Self {
        self.stale_time = d;
        self
    }

    pub fn gc_time(mut self, d: Duration) -> Self {
        self.gc_time = d;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }

    pub fn rate_limit(mut self, tier: LimiterTier, key: impl Into<String>) -> Self {
        self.rate_limit = Some((tier, key.into()));
        self
    }

    pub fn refetch_on_mount(mut self, on: bool) -> Self {
        self.refetch_on_mount = on;
        self
    }

    pub fn refetch_on_reconnect(mut self, on: bool) -> Self {
        self.refetch_on_reconnect = on;
        self
    }

    pub fn refetch_on_focus(mut self, on: bool) -> Self {
        self.refetch_on_focus = on;
        self
    }
}

type InFlightRx = watch::Receiver<Option<Result<Value>>>;
type InFlightTx = watch::Sender<Option<Result<Value>>>;

struct Entry {
    data: Option<Value>,
    error: Option<ApiError>,
    status: QueryStatus,
    fetched_at: Option<Instant>,
    stale_at: Option<Instant>,
    expire_at: Option<Instant>,
    subscribers: usize,
    /// Bumped on every data write. Guards rollbacks and late refresh
    /// results against overwriting newer data.
    generation: u64,
    /// Set by the optimistic coordinator; suppresses background refresh.
    paused: bool,
    fetcher: Option<QueryFn>,
    config: QueryConfig,
    in_flight: Option<InFlightRx>,
    watch_tx: watch::Sender<QuerySnapshot>,
}

impl Entry {
    fn new(config: QueryConfig) -> Self {
        let (watch_tx, _) = watch::channel(QuerySnapshot::pending());
        Self {
            data: None,
            error: None,
            status: QueryStatus::Pending,
            fetched_at: None,
            stale_at: None,
            expire_at: None,
            subscribers: 0,
            generation: 0,
            paused: false,
            fetcher: None,
            config,
            in_flight: None,
            watch_tx,
        }
    }

    fn snapshot(&self) -> QuerySnapshot {
        QuerySnapshot {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
        }
    }

    fn publish(&self) {
        self.watch_tx.send_replace(self.snapshot());
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.data.is_some() && matches!(self.stale_at, Some(at) if now < at)
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.expire_at {
            Some(at) => now >= at,
            None => false,
        }
    }
}

struct CacheShared {
    entries: Mutex<HashMap<QueryKey, Entry>>,
    defaults: QueryConfig,
    limiters: Arc<RateLimiters>,
    notifier: Arc<dyn Notifier>,
}

/// Keyed query/mutation cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

enum FetchPlan {
    /// Serve cached data, optionally after scheduling a background refresh.
    Hit(Value),
    /// Wait on the fetch in flight for this key (ours or someone else's).
    Join(InFlightRx),
}

impl QueryCache {
    /// Create a cache with default limiters and a tracing notifier.
    pub fn new(defaults: QueryConfig) -> Self {
        Self::with_context(
            defaults,
            Arc::new(RateLimiters::default()),
            Arc::new(TracingNotifier),
        )
    }

    /// Create a cache sharing limiters and notifier with the rest of the
    /// application context.
    pub fn with_context(
        defaults: QueryConfig,
        limiters: Arc<RateLimiters>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                entries: Mutex::new(HashMap::new()),
                defaults,
                limiters,
                notifier,
            }),
        }
    }

    /// Default configuration applied when a call site passes none.
    pub fn defaults(&self) -> QueryConfig {
        self.shared.defaults.clone()
    }

    pub fn limiters(&self) -> &Arc<RateLimiters> {
        &self.shared.limiters
    }

    /// Fetch the value for `key`, consulting the cache first.
    ///
    /// Fresh entries resolve without suspending. Stale entries with active
    /// subscribers resolve immediately with the cached value while a
    /// background refresh runs — even when that refresh is already in
    /// flight. Absent or expired entries wait on a network fetch through
    /// the retry executor and rate-limiter gate; concurrent callers for
    /// the same key share that single fetch. The fetch itself runs on a
    /// detached task, so cancelling a waiting caller never cancels the
    /// shared operation or wedges the key.
    pub async fn fetch(&self, key: &QueryKey, op: QueryFn, config: &QueryConfig) -> Result<Value> {
        let plan = {
            let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(config.clone()));
            entry.fetcher = Some(op.clone());
            entry.config = config.clone();
            let now = Instant::now();

            if entry.is_fresh(now) {
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "kind" => "fresh").increment(1);
                FetchPlan::Hit(entry.data.clone().expect("fresh entry has data"))
            } else if entry.data.is_some() && !entry.is_expired(now) && entry.subscribers > 0 {
                // Stale-while-revalidate: serve what we have, reconcile
                // behind the caller's back. A refresh already in flight is
                // left alone (register_refresh no-ops); the caller still
                // gets the cached value without suspending.
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "kind" => "stale").increment(1);
                let data = entry.data.clone().expect("stale entry has data");
                Self::register_refresh(&self.shared, key, entry);
                FetchPlan::Hit(data)
            } else if let Some(rx) = &entry.in_flight {
                // No servable data: attach to the fetch in flight.
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "kind" => "dedup").increment(1);
                FetchPlan::Join(rx.clone())
            } else {
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
                let rx = Self::spawn_fetch(&self.shared, key, entry, op.clone(), true);
                entry.status = if entry.data.is_some() {
                    entry.status
                } else {
                    QueryStatus::Pending
                };
                entry.publish();
                FetchPlan::Join(rx)
            }
        };

        match plan {
            FetchPlan::Hit(value) => Ok(value),
            FetchPlan::Join(rx) => join_in_flight(rx).await,
        }
    }

    /// [`fetch`](Self::fetch) with an async closure instead of a [`QueryFn`].
    pub async fn fetch_with<F, Fut>(&self, key: &QueryKey, f: F, config: &QueryConfig) -> Result<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.fetch(key, query_fn(f), config).await
    }

    /// Force a network fetch for `key`, bypassing freshness.
    ///
    /// The cached value stays visible until the fetch settles.
    pub async fn refetch(&self, key: &QueryKey, op: QueryFn, config: &QueryConfig) -> Result<Value> {
        {
            let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
            if let Some(entry) = entries.get_mut(key) {
                let now = Instant::now();
                entry.stale_at = Some(now);
                entry.expire_at = Some(now);
            }
        }
        self.fetch(key, op, config).await
    }

    /// Current cached data for `key`, if any.
    pub fn get_data(&self, key: &QueryKey) -> Option<Value> {
        let entries = self.shared.entries.lock().expect("cache lock poisoned");
        entries.get(key).and_then(|e| e.data.clone())
    }

    /// When the data for `key` was last fetched from the network. `None`
    /// for absent entries and entries holding only locally written data.
    pub fn last_fetched(&self, key: &QueryKey) -> Option<Instant> {
        let entries = self.shared.entries.lock().expect("cache lock poisoned");
        entries.get(key).and_then(|e| e.fetched_at)
    }

    /// Synchronously replace the cached data for `key`.
    ///
    /// `updater` receives the current value and returns the new one. The
    /// write bumps the entry generation and is visible to every subscriber
    /// before this call returns. Creates the entry if absent.
    pub fn set_data(&self, key: &QueryKey, updater: impl FnOnce(Option<Value>) -> Value) {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(self.shared.defaults.clone()));
        let next = updater(entry.data.take());
        entry.data = Some(next);
        entry.generation += 1;
        // Locally written data is unconfirmed: present but refreshable.
        if matches!(entry.status, QueryStatus::Pending | QueryStatus::Error) {
            entry.status = QueryStatus::Stale;
        }
        entry.publish();
    }

    /// Mark every entry whose key begins with `prefix` stale, and schedule
    /// a refresh for the subscribed ones.
    pub fn invalidate(&self, prefix: &QueryKey) {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let mut matched = 0usize;
        for (key, entry) in entries.iter_mut() {
            if !key.starts_with(prefix) {
                continue;
            }
            matched += 1;
            entry.stale_at = Some(now);
            if entry.status == QueryStatus::Fresh {
                entry.status = QueryStatus::Stale;
                entry.publish();
            }
            if entry.subscribers > 0 {
                Self::register_refresh(&self.shared, key, entry);
            }
        }
        debug!(prefix = %prefix, matched, "invalidated cache entries");
    }

    /// Attach a subscriber to `key`, creating the entry if needed.
    ///
    /// The returned handle observes every published snapshot; dropping it
    /// decrements the refcount. Dropping does not abort an in-flight fetch
    /// shared with other subscribers — it only stops delivery to this one.
    pub fn subscribe(&self, key: &QueryKey) -> QuerySubscription {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(self.shared.defaults.clone()));
        entry.subscribers += 1;
        QuerySubscription {
            shared: self.shared.clone(),
            key: key.clone(),
            rx: entry.watch_tx.subscribe(),
        }
    }

    /// Active subscriber count for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        let entries = self.shared.entries.lock().expect("cache lock poisoned");
        entries.get(key).map(|e| e.subscribers).unwrap_or(0)
    }

    /// One maintenance pass: refresh stale subscribed entries, then remove
    /// unreferenced entries past their expiry.
    pub fn maintenance_sweep(&self) {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();

        // A dropped sender means the fetch task died without settling
        // (panicked op); clear the marker so the key can fetch again.
        for entry in entries.values_mut() {
            if matches!(&entry.in_flight, Some(rx) if rx.has_changed().is_err()) {
                entry.in_flight = None;
            }
        }

        let stale_keys: Vec<QueryKey> = entries
            .iter()
            .filter(|(_, e)| {
                e.subscribers > 0
                    && e.data.is_some()
                    && matches!(e.stale_at, Some(at) if now >= at)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale_keys {
            if let Some(entry) = entries.get_mut(key) {
                Self::register_refresh(&self.shared, key, entry);
            }
        }

        let before = entries.len();
        entries.retain(|_, e| !(e.subscribers == 0 && e.is_expired(now) && e.in_flight.is_none()));
        let removed = before - entries.len();
        if removed > 0 || !stale_keys.is_empty() {
            debug!(removed, refreshed = stale_keys.len(), "maintenance sweep");
        }
    }

    /// Spawn a background task running [`maintenance_sweep`](Self::maintenance_sweep)
    /// on an interval. The task holds only a weak reference and exits when
    /// the cache is dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                QueryCache { shared }.maintenance_sweep();
            }
        })
    }

    /// Signal network reconnection: refetch subscribed entries configured
    /// with `refetch_on_reconnect`.
    pub fn notify_reconnect(&self) {
        self.refetch_flagged(|c| c.refetch_on_reconnect);
    }

    /// Signal window focus: refetch subscribed entries configured with
    /// `refetch_on_focus`.
    pub fn notify_focus(&self) {
        self.refetch_flagged(|c| c.refetch_on_focus);
    }

    fn refetch_flagged(&self, flag: impl Fn(&QueryConfig) -> bool) {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let now = Instant::now();
        let keys: Vec<QueryKey> = entries
            .iter()
            .filter(|(_, e)| e.subscribers > 0 && flag(&e.config))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(entry) = entries.get_mut(&key) {
                entry.stale_at = Some(now);
                Self::register_refresh(&self.shared, &key, entry);
            }
        }
    }

    /// Register and spawn a background refresh for `entry` unless one is
    /// already in flight, the entry is paused, or no fetcher is stored.
    /// Must be called with the entry lock held (takes the entry mutably).
    fn register_refresh(shared: &Arc<CacheShared>, key: &QueryKey, entry: &mut Entry) {
        if entry.in_flight.is_some() || entry.paused {
            return;
        }
        let Some(op) = entry.fetcher.clone() else {
            return;
        };
        Self::spawn_fetch(shared, key, entry, op, false);
    }

    /// Run the network fetch for `entry` on a detached task and mark it in
    /// flight. The task owns the sender and settles the entry itself, so a
    /// cancelled caller can never leave the key wedged. Must be called with
    /// the entry lock held.
    fn spawn_fetch(
        shared: &Arc<CacheShared>,
        key: &QueryKey,
        entry: &mut Entry,
        op: QueryFn,
        foreground: bool,
    ) -> InFlightRx {
        let (tx, rx) = watch::channel(None);
        entry.in_flight = Some(rx.clone());
        let generation = entry.generation;
        let config = entry.config.clone();
        let shared = shared.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let result = run_query(&shared.limiters, &config, &op).await;
            if !foreground {
                if let Err(err) = &result {
                    // Stale data is still on screen; log, don't notify.
                    warn!(key = %key, error = %err, "background refresh failed");
                }
            }
            shared.settle_fetch(&key, result, foreground, generation, &tx);
        });
        rx
    }

    // ---- crate-internal hooks for the optimistic coordinator ----

    pub(crate) fn pause_refresh(&self, key: &QueryKey) {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(self.shared.defaults.clone()));
        entry.paused = true;
    }

    pub(crate) fn resume_refresh(&self, key: &QueryKey) {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.paused = false;
        }
    }

    /// Snapshot current data and apply an optimistic write in one critical
    /// section. Returns the previous data and the generation after the
    /// write (the rollback guard token).
    pub(crate) fn apply_optimistic(
        &self,
        key: &QueryKey,
        apply: impl FnOnce(Option<Value>) -> Value,
    ) -> (Option<Value>, u64) {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(self.shared.defaults.clone()));
        let previous = entry.data.clone();
        entry.data = Some(apply(previous.clone()));
        entry.generation += 1;
        if matches!(entry.status, QueryStatus::Pending | QueryStatus::Error) {
            entry.status = QueryStatus::Stale;
        }
        entry.publish();
        (previous, entry.generation)
    }

    /// Restore `previous` verbatim iff the entry generation still equals
    /// `expected`. Returns whether the rollback was performed.
    pub(crate) fn restore_if_unchanged(
        &self,
        key: &QueryKey,
        expected: u64,
        previous: Option<Value>,
    ) -> bool {
        let mut entries = self.shared.entries.lock().expect("cache lock poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.generation != expected {
            debug!(key = %key, "skipping rollback; entry changed since optimistic apply");
            return false;
        }
        let had_previous = previous.is_some();
        entry.data = previous;
        entry.generation += 1;
        if !had_previous {
            entry.status = QueryStatus::Pending;
        }
        entry.publish();
        true
    }

    pub(crate) fn notify_terminal_error(&self, err: &ApiError) {
        self.shared.notifier.notify_error(&err.to_string());
    }
}

impl CacheShared {
    /// Record the outcome of a fetch and wake everything waiting on it.
    ///
    /// Foreground fetches are authoritative and always write. Background
    /// refreshes write only if the entry generation is unchanged since the
    /// refresh started; a failed background refresh keeps the stale data.
    fn settle_fetch(
        &self,
        key: &QueryKey,
        result: Result<Value>,
        foreground: bool,
        started_generation: u64,
        tx: &InFlightTx,
    ) {
        {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            if let Some(entry) = entries.get_mut(key) {
                entry.in_flight = None;
                match &result {
                    Ok(value) => {
                        if foreground || entry.generation == started_generation {
                            let now = Instant::now();
                            entry.data = Some(value.clone());
                            entry.error = None;
                            entry.status = QueryStatus::Fresh;
                            entry.fetched_at = Some(now);
                            entry.stale_at = Some(now + entry.config.stale_time);
                            entry.expire_at =
                                Some(now + entry.config.stale_time + entry.config.gc_time);
                            entry.generation += 1;
                            entry.publish();
                        } else {
                            debug!(key = %key, "discarding refresh result; data changed in flight");
                        }
                    }
                    Err(err) => {
                        entry.error = Some(err.clone());
                        if foreground && entry.data.is_none() {
                            entry.status = QueryStatus::Error;
                        }
                        entry.publish();
                    }
                }
            }
        }
        if foreground {
            if let Err(err) = &result {
                self.notifier.notify_error(&err.to_string());
            }
        }
        let _ = tx.send(Some(result));
    }
}

/// Run one query operation under retry, timeout, and the limiter gate.
///
/// The gate is evaluated per attempt: a retry that arrives while the key
/// is blocked fails with `RateLimitExceeded` before any network activity,
/// which is terminal and stops the retry loop.
async fn run_query(
    limiters: &Arc<RateLimiters>,
    config: &QueryConfig,
    op: &QueryFn,
) -> Result<Value> {
    let limiters = limiters.clone();
    let rate = config.rate_limit.clone();
    let op = op.clone();
    with_retry_and_timeout(&config.retry, config.timeout, "query", move || {
        let limiters = limiters.clone();
        let rate = rate.clone();
        let op = op.clone();
        async move {
            if let Some((tier, limit_key)) = &rate {
                let limiter = limiters.tier(*tier);
                if !limiter.is_allowed(limit_key) {
                    return Err(ApiError::RateLimitExceeded {
                        retry_in: limiter.reset_in(limit_key),
                    });
                }
            }
            op().await
        }
    })
    .await
}

/// Wait for the fetch already in flight for a key.
async fn join_in_flight(mut rx: InFlightRx) -> Result<Value> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            return Err(ApiError::Network("in-flight fetch abandoned".into()));
        }
    }
}

/// Live subscription to one cache entry.
///
/// Holds a watch receiver of [`QuerySnapshot`]s; drop to detach.
pub struct QuerySubscription {
    shared: Arc<CacheShared>,
    key: QueryKey,
    rx: watch::Receiver<QuerySnapshot>,
}

impl QuerySubscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> QuerySnapshot {
        self.rx.borrow().clone()
    }

    /// Wait until a new snapshot is published and return it. Returns
    /// `None` if the entry was garbage-collected.
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.shared.entries.lock() {
            if let Some(entry) = entries.get_mut(&self.key) {
                entry.subscribers = entry.subscribers.saturating_sub(1);
            }
        }
    }
}
