//! Builder and root context.
//!
//! [`ApiClient`] is the explicitly constructed context object owning the
//! cache, the limiter tiers, and the transport. It is created once at
//! application startup, passed by reference to consumers, and dropped at
//! shutdown — never ambient.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{OptimisticOptions, QueryCache, QueryConfig, QueryFn, QueryKey};
use crate::limit::{RateLimitConfig, RateLimiters};
use crate::query::{Mutation, QueryHandle};
use crate::transport::{HttpTransport, Notifier, TracingNotifier, TransportConfig};
use crate::{ApiError, Result};

/// Main entry point for creating client instances.
pub struct Skjold;

impl Skjold {
    /// Create a new builder for configuring the client.
    pub fn builder() -> SkjoldBuilder {
        SkjoldBuilder::new()
    }
}

/// Builder for configuring client instances.
pub struct SkjoldBuilder {
    base_url: Option<String>,
    request_timeout: Duration,
    query_defaults: QueryConfig,
    limiters: Option<RateLimiters>,
    notifier: Option<Arc<dyn Notifier>>,
    token_provider: Option<Box<dyn Fn() -> Option<String> + Send + Sync>>,
}

impl SkjoldBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_secs(10),
            query_defaults: QueryConfig::default(),
            limiters: None,
            notifier: None,
            token_provider: None,
        }
    }

    /// Set the API base URL (required).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Per-request socket timeout for the transport.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Default query configuration applied when call sites pass none.
    pub fn query_defaults(mut self, defaults: QueryConfig) -> Self {
        self.query_defaults = defaults;
        self
    }

    /// Override the per-tier rate limit configurations.
    pub fn limiter_configs(
        mut self,
        general: RateLimitConfig,
        api: RateLimitConfig,
        auth: RateLimitConfig,
    ) -> Self {
        self.limiters = Some(RateLimiters::with_configs(general, api, auth));
        self
    }

    /// Sink for user-visible error notifications.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Supplier of the current bearer token, consulted per request.
    pub fn token_provider(
        mut self,
        provider: impl Fn() -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.token_provider = Some(Box::new(provider));
        self
    }

    /// Build the client context.
    pub fn build(self) -> Result<ApiClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| ApiError::Configuration("base_url is required".into()))?;
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier));

        let config = TransportConfig::new(base_url).timeout(self.request_timeout);
        let mut transport = HttpTransport::with_notifier(config, notifier.clone())?;
        if let Some(provider) = self.token_provider {
            transport = transport.token_provider(provider);
        }

        let limiters = Arc::new(self.limiters.unwrap_or_default());
        let cache = QueryCache::with_context(self.query_defaults, limiters.clone(), notifier);

        Ok(ApiClient {
            transport: Arc::new(transport),
            cache,
            limiters,
        })
    }
}

impl Default for SkjoldBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Root context owning the cache, limiter tiers, and transport.
pub struct ApiClient {
    transport: Arc<HttpTransport>,
    cache: QueryCache,
    limiters: Arc<RateLimiters>,
}

impl ApiClient {
    pub fn transport(&self) -> &Arc<HttpTransport> {
        &self.transport
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn limiters(&self) -> &Arc<RateLimiters> {
        &self.limiters
    }

    /// Open a [`QueryHandle`] using the client's default configuration.
    pub fn query(&self, key: QueryKey, op: QueryFn) -> QueryHandle {
        QueryHandle::new(&self.cache, key, op, self.cache.defaults())
    }

    /// Open a [`QueryHandle`] with explicit configuration.
    pub fn query_with(&self, key: QueryKey, op: QueryFn, config: QueryConfig) -> QueryHandle {
        QueryHandle::new(&self.cache, key, op, config)
    }

    /// Create a reusable optimistic [`Mutation`].
    pub fn mutation(&self, op: QueryFn, options: OptimisticOptions) -> Mutation {
        Mutation::new(&self.cache, op, options)
    }

    /// Start the cache maintenance task (stale refresh + garbage
    /// collection) on the given interval.
    pub fn spawn_maintenance(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_maintenance(interval)
    }
}
