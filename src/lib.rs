//! Skjold — client-side resilience and caching layer for remote HTTP APIs.
//!
//! Sits between UI code and a backend: masks transient failures with
//! jittered exponential backoff, keeps the backend safe from retry storms
//! and duplicate requests, holds a keyed cache of server state coherent
//! with optimistic local edits, and exposes a uniform query/mutation
//! surface to callers. Per-endpoint calls are opaque async operations; the
//! core never enumerates endpoints.
//!
//! # Query example
//!
//! ```rust,no_run
//! use skjold::{key, Skjold};
//! use skjold::cache::query_fn;
//! use skjold::transport::RequestOptions;
//! use std::sync::Arc;
//!
//! # async fn demo() -> skjold::Result<()> {
//! let client = Skjold::builder()
//!     .base_url("https://api.example.com/api/v1")
//!     .build()?;
//!
//! let transport = client.transport().clone();
//! let orders = client.query(
//!     key!["orders", "list"],
//!     query_fn(move || {
//!         let transport = transport.clone();
//!         async move { transport.get("/orders", &RequestOptions::silent()).await }
//!     }),
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # Optimistic mutation example
//!
//! ```rust,ignore
//! let mutation = client.mutation(update_op, OptimisticOptions::default());
//! // Subscribers see the predicted value immediately; a failure rolls the
//! // cache back to the exact pre-mutation value.
//! mutation.run(&key!["orders", "detail", "7"], |old| patched(old)).await?;
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod limit;
pub mod query;
pub mod retry;
pub mod telemetry;
pub mod transport;

// Re-export main types at crate root
pub use cache::{
    run_optimistic, MutationState, OptimisticOptions, QueryCache, QueryConfig, QueryKey,
    QuerySnapshot, QueryStatus,
};
pub use client::{ApiClient, Skjold, SkjoldBuilder};
pub use error::{ApiError, Result};
pub use limit::{LimiterTier, RateLimitConfig, RateLimiters, SlidingWindowLimiter};
pub use query::{paginated_key, Mutation, PollingQuery, QueryHandle};
pub use retry::{with_retry, with_retry_and_timeout, with_timeout, RetryPolicy};
pub use transport::{
    HttpTransport, Notifier, RequestOptions, Transport, TransportConfig,
};
