//! Telemetry metric name constants.
//!
//! Centralised metric names for skjold operations. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `skjold_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation` — logical operation name supplied by the caller
//! - `status` — outcome: "ok" or "error"
//! - `tier` — rate limiter tier: "general", "api", or "auth"

/// Total HTTP requests issued through the transport.
///
/// Labels: `method`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "skjold_requests_total";

/// HTTP request duration in seconds.
///
/// Labels: `method`.
pub const REQUEST_DURATION_SECONDS: &str = "skjold_request_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `operation`.
pub const RETRIES_TOTAL: &str = "skjold_retries_total";

/// Total query cache hits (fresh or stale data served).
///
/// Labels: `kind` ("fresh" | "stale" | "dedup").
pub const CACHE_HITS_TOTAL: &str = "skjold_cache_hits_total";

/// Total query cache misses (a network fetch was required).
pub const CACHE_MISSES_TOTAL: &str = "skjold_cache_misses_total";

/// Total requests denied by local admission control.
///
/// Labels: `tier`.
pub const RATE_LIMITED_TOTAL: &str = "skjold_rate_limited_total";

/// Total optimistic mutations rolled back after a failed mutation.
pub const OPTIMISTIC_ROLLBACKS_TOTAL: &str = "skjold_optimistic_rollbacks_total";
