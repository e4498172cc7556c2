//! Request-path adapter for the rate limiter.
//!
//! A tower [`Layer`]/[`Service`] pair sits ahead of the route handlers,
//! derives the caller's identity, consumes a point from the tier wired to
//! the route group, and translates the outcome into response headers and
//! accept/reject decisions. Store failures degrade to pass-through: rate
//! limiting is a defense-in-depth layer, and an outage must not take the
//! API down with it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::json;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::config::RateLimitingConfig;
use crate::ratelimit::{ConsumeResult, RateLimiter};

/// Attaches one tier's limiter to a route group.
///
/// The route-to-tier mapping is the application's wiring decision: strict on
/// authentication routes, api on machine endpoints, general elsewhere.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    enabled: bool,
    skip_loopback: bool,
}

impl RateLimitLayer {
    /// Create a layer enforcing `limiter` under the given runtime switches.
    pub fn new(limiter: Arc<RateLimiter>, config: &RateLimitingConfig) -> Self {
        Self {
            limiter,
            enabled: config.enabled,
            skip_loopback: config.skip_loopback,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            enabled: self.enabled,
            skip_loopback: self.skip_loopback,
        }
    }
}

/// The middleware service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    enabled: bool,
    skip_loopback: bool,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let enabled = self.enabled;
        let skip_loopback = self.skip_loopback;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !enabled {
                return inner.call(request).await;
            }

            let peer_addr = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0);
            let client_key = derive_client_key(request.headers(), peer_addr);

            if skip_loopback && is_loopback_key(&client_key) {
                return inner.call(request).await;
            }

            match limiter.consume(&client_key).await {
                Ok(result) if result.allowed => {
                    let mut response = inner.call(request).await?;
                    apply_limit_headers(response.headers_mut(), &result);
                    Ok(response)
                }
                Ok(result) => {
                    debug!(
                        key = %client_key,
                        tier = %limiter.tier(),
                        retry_after = ?result.retry_after_secs,
                        "Request rejected by rate limiter"
                    );
                    Ok(deny_response(&limiter, &result))
                }
                Err(e) => {
                    // Fail open: the request proceeds without quota headers
                    warn!(
                        key = %client_key,
                        tier = %limiter.tier(),
                        error = %e,
                        "Rate limit store unavailable, allowing request"
                    );
                    inner.call(request).await
                }
            }
        })
    }
}

/// Derive the caller's identity for quota purposes.
///
/// Proxy headers are honored ahead of the socket address because the service
/// is assumed to run behind a trusted reverse proxy; deployers without one
/// must strip these headers upstream or accept the spoofing risk.
fn derive_client_key(headers: &HeaderMap, peer_addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_loopback_key(key: &str) -> bool {
    key.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

fn apply_limit_headers(headers: &mut HeaderMap, result: &ConsumeResult) {
    headers.insert("x-ratelimit-limit", header_value(result.limit));
    headers.insert("x-ratelimit-remaining", header_value(result.remaining));
    if let Some(reset) = DateTime::from_timestamp_millis(result.reset_at_ms) {
        headers.insert("x-ratelimit-reset", header_value(reset.to_rfc3339()));
    }
}

fn header_value(value: impl ToString) -> HeaderValue {
    // Numeric and RFC 3339 strings are always valid header values
    HeaderValue::from_str(&value.to_string()).unwrap()
}

fn deny_response(limiter: &RateLimiter, result: &ConsumeResult) -> Response {
    let retry_after = result.retry_after_secs.unwrap_or(1);
    let body = json!({
        "success": false,
        "error": {
            "code": "RATE_LIMIT_EXCEEDED",
            "message": limiter.tier().exceeded_message(),
            "details": { "retryAfter": retry_after },
        },
        "timestamp": Utc::now().to_rfc3339(),
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_limit_headers(response.headers_mut(), result);
    response
        .headers_mut()
        .insert("retry-after", header_value(retry_after));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::error::{FloodgateError, Result};
    use crate::ratelimit::{
        CounterSnapshot, CounterStore, RateLimitPolicy, SqliteCounterStore, Tier,
    };

    struct FailingStore;

    #[async_trait::async_trait]
    impl CounterStore for FailingStore {
        async fn increment_and_get(
            &self,
            _key: &str,
            _window_duration_secs: u64,
        ) -> Result<CounterSnapshot> {
            Err(FloodgateError::StoreUnavailable(sqlx::Error::PoolClosed))
        }

        async fn extend_expiry(&self, _key: &str, _expire_at_ms: i64) -> Result<i64> {
            Err(FloodgateError::StoreUnavailable(sqlx::Error::PoolClosed))
        }

        async fn purge_expired(&self, _now_ms: i64) -> Result<u64> {
            Err(FloodgateError::StoreUnavailable(sqlx::Error::PoolClosed))
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Err(FloodgateError::StoreUnavailable(sqlx::Error::PoolClosed))
        }
    }

    fn policy(points_limit: u64) -> RateLimitPolicy {
        RateLimitPolicy {
            points_limit,
            window_duration_secs: 60,
            block_duration_secs: 120,
        }
    }

    async fn memory_limiter(tier: Tier, points_limit: u64) -> Arc<RateLimiter> {
        let store: Arc<dyn CounterStore> =
            Arc::new(SqliteCounterStore::connect("sqlite::memory:").await.unwrap());
        Arc::new(RateLimiter::new(tier, policy(points_limit), store))
    }

    fn login_app(limiter: Arc<RateLimiter>, config: &RateLimitingConfig) -> Router {
        Router::new()
            .route("/login", post(|| async { StatusCode::OK }))
            .layer(RateLimitLayer::new(limiter, config))
    }

    fn login_request(client: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_strict_tier_end_to_end() {
        let limiter = memory_limiter(Tier::Strict, 3).await;
        let app = login_app(limiter, &RateLimitingConfig::default());

        for expected_remaining in ["2", "1", "0"] {
            let response = app.clone().oneshot(login_request("10.0.2.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-ratelimit-limit"], "3");
            assert_eq!(response.headers()["x-ratelimit-remaining"], expected_remaining);
            assert!(response.headers().contains_key("x-ratelimit-reset"));
        }

        let response = app.clone().oneshot(login_request("10.0.2.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert!(response.headers().contains_key("retry-after"));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(
            body["error"]["message"],
            "Too many authentication attempts, please try again later"
        );
        assert!(body["error"]["details"]["retryAfter"].as_u64().unwrap() > 0);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_general_tier_isolates_clients() {
        let limiter = memory_limiter(Tier::General, 10).await;
        let app = Router::new()
            .route("/", get(|| async { StatusCode::OK }))
            .layer(RateLimitLayer::new(limiter, &RateLimitingConfig::default()));

        let request = |client: &str| {
            Request::builder()
                .uri("/")
                .header("x-forwarded-for", client)
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..10 {
            let response = app.clone().oneshot(request("198.51.100.7")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request("198.51.100.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different derived key is untouched
        let response = app.clone().oneshot(request("198.51.100.8")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "9");
    }

    #[tokio::test]
    async fn test_fail_open_on_store_error() {
        let limiter = Arc::new(RateLimiter::new(
            Tier::General,
            policy(10),
            Arc::new(FailingStore),
        ));
        let app = login_app(limiter, &RateLimitingConfig::default());

        let response = app.clone().oneshot(login_request("10.0.2.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
        assert!(!response.headers().contains_key("x-ratelimit-remaining"));
        assert!(!response.headers().contains_key("x-ratelimit-reset"));
    }

    #[tokio::test]
    async fn test_disabled_limiting_passes_through() {
        let limiter = memory_limiter(Tier::Strict, 1).await;
        let config = RateLimitingConfig {
            enabled: false,
            ..RateLimitingConfig::default()
        };
        let app = login_app(limiter, &config);

        for _ in 0..5 {
            let response = app.clone().oneshot(login_request("10.0.2.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-limit"));
        }
    }

    #[tokio::test]
    async fn test_loopback_skip_when_configured() {
        let limiter = memory_limiter(Tier::Strict, 1).await;
        let config = RateLimitingConfig {
            skip_loopback: true,
            ..RateLimitingConfig::default()
        };
        let app = login_app(limiter, &config);

        // Loopback callers bypass the ceiling entirely
        for _ in 0..3 {
            let response = app.clone().oneshot(login_request("127.0.0.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-limit"));
        }

        // Everyone else is still limited
        let response = app.clone().oneshot(login_request("10.0.2.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.clone().oneshot(login_request("10.0.2.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_derive_client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));

        let peer = "192.0.2.1:443".parse().ok();
        assert_eq!(derive_client_key(&headers, peer), "203.0.113.5");
    }

    #[test]
    fn test_derive_client_key_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));

        let peer = "192.0.2.1:443".parse().ok();
        assert_eq!(derive_client_key(&headers, peer), "198.51.100.1");
    }

    #[test]
    fn test_derive_client_key_falls_back_to_peer() {
        let peer = "192.0.2.1:443".parse().ok();
        assert_eq!(derive_client_key(&HeaderMap::new(), peer), "192.0.2.1");
    }

    #[test]
    fn test_derive_client_key_unknown_without_identity() {
        assert_eq!(derive_client_key(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_empty_forwarded_for_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.1"));

        assert_eq!(derive_client_key(&headers, None), "198.51.100.1");
    }

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback_key("127.0.0.1"));
        assert!(is_loopback_key("::1"));
        assert!(!is_loopback_key("203.0.113.5"));
        assert!(!is_loopback_key("unknown"));
    }
}
