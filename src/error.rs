//! Skjold error types.
//!
//! All failures are normalized into [`ApiError`] once, at the transport
//! boundary. Upstream layers (retry, cache, mutation coordinator) match on
//! the variant and never re-wrap, so a caller can always branch on the
//! original classification.
//!
//! Errors are `Clone`: a deduplicated fetch broadcasts the same failure to
//! every caller that attached to the in-flight request.

use std::time::Duration;

/// Skjold error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// No response received at all (DNS, connect, reset). Always retryable.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a 5xx status. Retryable.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The server answered 429. Retryable; `retry_after` (from the
    /// `Retry-After` header) takes precedence over computed backoff.
    #[error("rate limited by server, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// A 4xx other than 401/429, or a 2xx whose response envelope carried a
    /// non-zero code. Terminal — the request itself was unacceptable.
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    /// The server answered 401. Terminal at this layer; surfaced as its own
    /// kind so the caller can trigger re-authentication without probing
    /// status codes.
    #[error("unauthorized")]
    Unauthorized,

    /// The overall operation deadline elapsed (covers the entire retry
    /// sequence, not a single attempt). Terminal.
    #[error("operation timed out")]
    Timeout,

    /// Caller-supplied input rejected before any network call. Terminal and
    /// never enters retry logic.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Local admission control refused the call before any network
    /// activity. Terminal from this layer's perspective; the caller may
    /// re-present after `retry_in`.
    #[error("local rate limit exceeded, retry in {retry_in:?}")]
    RateLimitExceeded { retry_in: Duration },

    /// The response body could not be parsed. Terminal.
    #[error("malformed response: {0}")]
    Decode(String),

    /// Local configuration problem (e.g. the HTTP client could not be
    /// constructed). Terminal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ApiError {
    /// Whether this error is transient and worth retrying.
    ///
    /// Mirrors the default retryable set: network-level failures, 5xx,
    /// server-side rate limiting, and 408 (request timeout at the server).
    /// Everything else is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Server { .. } => true,
            ApiError::RateLimited { .. } => true,
            ApiError::Client { status: 408, .. } => true,
            _ => false,
        }
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// HTTP status associated with this error, when one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } | ApiError::Client { status, .. } => Some(*status),
            ApiError::RateLimited { .. } => Some(429),
            ApiError::Unauthorized => Some(401),
            _ => None,
        }
    }

    /// Classify an HTTP status into an error variant.
    ///
    /// `message` is the server-supplied message when present; otherwise the
    /// static default for that status is used. This is the single place
    /// where raw statuses become taxonomy — called only by the transport.
    pub fn from_status(status: u16, message: Option<String>, retry_after: Option<Duration>) -> Self {
        let message = message.unwrap_or_else(|| default_message(status).to_owned());
        match status {
            401 => ApiError::Unauthorized,
            429 => ApiError::RateLimited { retry_after },
            s if s >= 500 => ApiError::Server { status, message },
            _ => ApiError::Client { status, message },
        }
    }
}

/// Human-readable default message for a status, used when the server
/// provides none.
pub fn default_message(status: u16) -> &'static str {
    match status {
        400 => "invalid request parameters",
        401 => "not authorized, please sign in again",
        403 => "permission denied for this operation",
        404 => "the requested resource does not exist",
        405 => "request method not allowed",
        408 => "request timed out",
        409 => "data conflict",
        422 => "data validation failed",
        429 => "too many requests, please try again later",
        500 => "internal server error",
        502 => "bad gateway",
        503 => "service temporarily unavailable",
        504 => "gateway timeout",
        _ => "request failed",
    }
}

/// Result type alias for skjold operations.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ApiError::Network("reset".into()).is_transient());
        assert!(ApiError::Server {
            status: 503,
            message: "down".into()
        }
        .is_transient());
        assert!(ApiError::RateLimited { retry_after: None }.is_transient());
        assert!(ApiError::Client {
            status: 408,
            message: "slow".into()
        }
        .is_transient());

        assert!(!ApiError::Unauthorized.is_transient());
        assert!(!ApiError::Timeout.is_transient());
        assert!(!ApiError::Validation("bad".into()).is_transient());
        assert!(!ApiError::RateLimitExceeded {
            retry_in: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!ApiError::Client {
            status: 404,
            message: "gone".into()
        }
        .is_transient());
    }

    #[test]
    fn from_status_maps_distinguished_kinds() {
        assert!(matches!(
            ApiError::from_status(401, None, None),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::from_status(429, None, Some(Duration::from_secs(2))),
            ApiError::RateLimited {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            ApiError::from_status(502, None, None),
            ApiError::Server { status: 502, .. }
        ));
        assert!(matches!(
            ApiError::from_status(404, None, None),
            ApiError::Client { status: 404, .. }
        ));
    }

    #[test]
    fn from_status_prefers_server_message() {
        match ApiError::from_status(422, Some("email taken".into()), None) {
            ApiError::Client { message, .. } => assert_eq!(message, "email taken"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn from_status_falls_back_to_table() {
        match ApiError::from_status(503, None, None) {
            ApiError::Server { message, .. } => {
                assert_eq!(message, "service temporarily unavailable")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
