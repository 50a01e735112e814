//! HTTP transport — the single choke point for outbound calls.
//!
//! Every typed per-endpoint call funnels through [`HttpTransport::request`],
//! which attaches a unique request-id header for tracing, attaches the
//! current bearer token when a provider is configured, unwraps the server's
//! success envelope so callers receive the payload directly, and normalizes
//! every failure into [`ApiError`] exactly once.
//!
//! A failed call emits one user-visible notification through the
//! [`Notifier`] unless the caller opts out with [`RequestOptions::silent`].
//! Calls issued under the retry executor or a background refresh are
//! silent; the owning layer surfaces the single terminal notification, so
//! the user never sees one toast per retry attempt.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::default_message;
use crate::telemetry;
use crate::{ApiError, Result};

/// Sink for user-visible error notifications.
///
/// Implementations are synchronous and must not block; a UI host typically
/// pushes the message onto a toast queue.
pub trait Notifier: Send + Sync {
    fn notify_error(&self, message: &str);
}

/// Notifier that drops all messages.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_error(&self, _message: &str) {}
}

/// Notifier that forwards messages to `tracing` at error level. The
/// default when no notifier is configured.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_error(&self, message: &str) {
        error!(message, "request failed");
    }
}

/// Supplier of the current bearer token, consulted per request.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Suppress the user-visible notification for a failed call. Set by
    /// layers that surface their own terminal notification.
    pub silent: bool,
}

impl RequestOptions {
    /// Options with the notification suppressed.
    pub fn silent() -> Self {
        Self { silent: true }
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL prepended to every request path.
    pub base_url: String,
    /// Per-request socket timeout. Distinct from the operation-level
    /// deadline in [`crate::retry::with_timeout`]; expiry here surfaces as
    /// a retryable network error. Default: 10s.
    pub timeout: Duration,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Abstract transport seam.
///
/// [`HttpTransport`] is the production implementation; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Value>;
}

/// Production transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    notifier: Arc<dyn Notifier>,
    token_provider: Option<TokenProvider>,
}

impl HttpTransport {
    /// Build a transport with the default [`TracingNotifier`].
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_notifier(config, Arc::new(TracingNotifier))
    }

    /// Build a transport with an explicit notifier.
    pub fn with_notifier(config: TransportConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url,
            notifier,
            token_provider: None,
        })
    }

    /// Attach a bearer-token provider, consulted on every request.
    pub fn token_provider(mut self, provider: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    /// Perform a request and return the unwrapped payload.
    ///
    /// 2xx responses carrying the `{code, message, data}` envelope resolve
    /// to `data` when `code == 0` and to a [`ApiError::Client`] carrying the
    /// envelope message otherwise. 2xx bodies without an envelope are
    /// returned as-is. Failure statuses are classified by
    /// [`ApiError::from_status`].
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Value> {
        let result = self.request_inner(method.clone(), path, payload).await;

        let status_label = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "method" => method.to_string(),
            "status" => status_label,
        )
        .increment(1);

        if let Err(err) = &result {
            if !options.silent {
                self.notifier.notify_error(&err.to_string());
            }
        }
        result
    }

    async fn request_inner(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let request_id = new_request_id();

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header("X-Request-Id", &request_id);
        if let Some(provider) = &self.token_provider {
            if let Some(token) = provider() {
                builder = builder.bearer_auth(token);
            }
        }
        if let Some(body) = &payload {
            builder = builder.json(body);
        }

        debug!(%method, path, request_id, "dispatching request");
        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "method" => method.to_string())
            .record(started.elapsed().as_secs_f64());

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let body: Value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .map_err(|e| ApiError::Decode(format!("invalid JSON body: {e}")))?
        };

        if status.is_success() {
            return unwrap_envelope(status.as_u16(), body);
        }
        Err(ApiError::from_status(
            status.as_u16(),
            server_message(&body),
            retry_after,
        ))
    }

    /// GET request.
    pub async fn get(&self, path: &str, options: &RequestOptions) -> Result<Value> {
        self.request(Method::GET, path, None, options).await
    }

    /// POST request with a JSON payload.
    pub async fn post(&self, path: &str, payload: Value, options: &RequestOptions) -> Result<Value> {
        self.request(Method::POST, path, Some(payload), options).await
    }

    /// PUT request with a JSON payload.
    pub async fn put(&self, path: &str, payload: Value, options: &RequestOptions) -> Result<Value> {
        self.request(Method::PUT, path, Some(payload), options).await
    }

    /// PATCH request with a JSON payload.
    pub async fn patch(&self, path: &str, payload: Value, options: &RequestOptions) -> Result<Value> {
        self.request(Method::PATCH, path, Some(payload), options).await
    }

    /// DELETE request.
    pub async fn delete(&self, path: &str, options: &RequestOptions) -> Result<Value> {
        self.request(Method::DELETE, path, None, options).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: Method,
        path: &str,
        payload: Option<Value>,
        options: &RequestOptions,
    ) -> Result<Value> {
        HttpTransport::request(self, method, path, payload, options).await
    }
}

/// Unwrap the `{code, message, data}` success envelope.
fn unwrap_envelope(status: u16, body: Value) -> Result<Value> {
    let Some(code) = body.get("code").and_then(Value::as_i64) else {
        // Not enveloped; hand the body through untouched.
        return Ok(body);
    };
    if code == 0 {
        return Ok(body.get("data").cloned().unwrap_or(Value::Null));
    }
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| default_message(status).to_owned());
    Err(ApiError::Client { status, message })
}

/// Extract a human-readable message from an error body, probing the shapes
/// the backend actually produces: `{error: {message}}` and `{message}`.
fn server_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| body.get("message").and_then(Value::as_str))
        .map(str::to_owned)
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Unique-enough request identifier: millisecond timestamp plus a random
/// hex suffix.
fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{millis:x}-{:08x}", fastrand::u32(..))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_unwraps_data_on_code_zero() {
        let body = json!({"code": 0, "message": null, "data": {"id": "42"}});
        assert_eq!(unwrap_envelope(200, body).unwrap(), json!({"id": "42"}));
    }

    #[test]
    fn envelope_nonzero_code_is_client_error() {
        let body = json!({"code": 1003, "message": "merchant suspended"});
        match unwrap_envelope(200, body) {
            Err(ApiError::Client { status, message }) => {
                assert_eq!(status, 200);
                assert_eq!(message, "merchant suspended");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unenveloped_body_passes_through() {
        let body = json!([1, 2, 3]);
        assert_eq!(unwrap_envelope(200, body.clone()).unwrap(), body);
    }

    #[test]
    fn server_message_probes_both_shapes() {
        assert_eq!(
            server_message(&json!({"error": {"message": "nested"}})),
            Some("nested".to_owned())
        );
        assert_eq!(
            server_message(&json!({"message": "flat"})),
            Some("flat".to_owned())
        );
        assert_eq!(server_message(&json!({"other": true})), None);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert_ne!(a, b);
    }
}
