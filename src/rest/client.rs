//! REST client with conditional requests, resilience chain, and typed
//! error translation
//!
//! Every request runs the same pipeline: resolve URL, look up the cached
//! validator, attach credentials, then dispatch through rate limiter ->
//! bulkhead -> retry -> circuit breaker. Rate-limit headers on the way out
//! feed the adaptive limiter through the registered callback.

use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::{Method, StatusCode};
use url::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::{ContextAwareProvider, RequestContext};
use crate::error::{ErrorKind, MeshError, Result};
use crate::metrics::{self, OpTimer, TimerTarget};
use crate::resilience::{AdaptiveRateLimiter, Bulkhead, CircuitBreaker, RetryPolicy};

use super::conditional_cache::ConditionalCache;
use super::rate_limit::{parse_rate_limit_headers, RateLimitCallback};

const ACCEPT_HEADER: &str = "application/vnd.github.v3+json";

/// Error envelope returned by the upstream on failures.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    message: Option<String>,
    documentation_url: Option<String>,
}

/// Configuration for the REST client
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout: std::time::Duration,
    pub connect_timeout: std::time::Duration,
    pub conditional_cache_capacity: usize,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            user_agent: format!("mesh-adapter/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: std::time::Duration::from_secs(30),
            connect_timeout: std::time::Duration::from_secs(10),
            conditional_cache_capacity: 1_024,
        }
    }
}

/// REST client fronting the upstream API.
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    auth: Arc<ContextAwareProvider>,
    cache: ConditionalCache,
    limiter: Arc<AdaptiveRateLimiter>,
    bulkhead: Arc<Bulkhead>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    rate_limit_callback: RwLock<Option<RateLimitCallback>>,
}

impl RestClient {
    pub fn new(
        config: RestClientConfig,
        auth: Arc<ContextAwareProvider>,
        limiter: Arc<AdaptiveRateLimiter>,
        bulkhead: Arc<Bulkhead>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HEADER));

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .build()?;

        let base_url = Url::parse(&config.base_url).map_err(|e| {
            MeshError::validation(format!("invalid base url {}: {}", config.base_url, e))
        })?;

        Ok(Self {
            http,
            base_url,
            auth,
            cache: ConditionalCache::new(config.conditional_cache_capacity),
            limiter,
            bulkhead,
            breaker,
            retry,
            rate_limit_callback: RwLock::new(None),
        })
    }

    /// Registers the callback invoked with every parsed rate-limit
    /// snapshot. The orchestrator points this at the adaptive limiter.
    pub fn set_rate_limit_callback(&self, callback: RateLimitCallback) {
        *self.rate_limit_callback.write() = Some(callback);
    }

    /// Drops the cached conditional entry for a request.
    pub fn invalidate_cache(&self, method: &Method, path: &str) -> Result<()> {
        let url = self.resolve_url(path)?;
        self.cache.invalidate(method.as_str(), url.as_str());
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, ctx: &RequestContext, path: &str) -> Result<T> {
        self.request(ctx, Method::GET, path, None::<&Value>).await
    }

    pub async fn post<T, B>(&self, ctx: &RequestContext, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        self.request(ctx, Method::POST, path, Some(body)).await
    }

    pub async fn put<T, B>(&self, ctx: &RequestContext, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        self.request(ctx, Method::PUT, path, Some(body)).await
    }

    pub async fn patch<T, B>(&self, ctx: &RequestContext, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        self.request(ctx, Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        self.request(ctx, Method::DELETE, path, None::<&Value>).await
    }

    /// Generic decode entry point: the response body deserializes straight
    /// into the caller's type. Empty bodies decode as `null`.
    pub async fn request<T, B>(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = self.resolve_url(path)?;
        // Serialize once; each retry attempt reuses the same value.
        let body_json = body.map(serde_json::to_value).transpose()?;

        let bytes = self.dispatch(ctx, method, url, body_json).await?;

        if bytes.is_empty() {
            serde_json::from_slice(b"null").map_err(Into::into)
        } else {
            serde_json::from_slice(&bytes).map_err(Into::into)
        }
    }

    /// Resolves a path against the base URL. Absolute inputs pass through;
    /// relative inputs join the base with a leading slash. The resolved
    /// absolute URL is the conditional-cache key component.
    fn resolve_url(&self, path: &str) -> Result<Url> {
        if let Ok(absolute) = Url::parse(path) {
            if !absolute.cannot_be_a_base() {
                return Ok(absolute);
            }
        }
        let relative = path.strip_prefix('/').unwrap_or(path);
        self.base_url
            .join(relative)
            .map_err(|e| MeshError::validation(format!("invalid request path {}: {}", path, e)))
    }

    async fn dispatch(
        &self,
        ctx: &RequestContext,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Vec<u8>> {
        let operation = format!("{} {}", method, url.path());

        self.limiter.wait().await?;

        self.bulkhead
            .execute(|| async {
                self.retry
                    .execute(&operation, || {
                        let method = method.clone();
                        let url = url.clone();
                        let body = body.clone();
                        async move {
                            self.breaker
                                .execute(|| self.round_trip(ctx, method, url, body))
                                .await
                        }
                    })
                    .await
            })
            .await
    }

    async fn round_trip(
        &self,
        ctx: &RequestContext,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Vec<u8>> {
        let method_label = method_label(&method);
        let _timer = OpTimer::new(method_label, TimerTarget::Http);

        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(body) = &body {
            request = request.json(body);
        }

        let validator = self.cache.validator(method.as_str(), url.as_str());
        if let Some(etag) = &validator {
            request = request.header(IF_NONE_MATCH, etag);
        }

        request = self.auth.attach_for(ctx, request).await?;

        debug!(method = %method, url = %url, conditional = validator.is_some(), "Dispatching request");

        let response = request.send().await?;
        let status = response.status();
        metrics::record_http_request(method.as_str(), status.as_u16());

        if let Some(snapshot) = parse_rate_limit_headers(response.headers()) {
            if let Some(callback) = self.rate_limit_callback.read().as_ref() {
                callback(snapshot);
            }
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        if status == StatusCode::NOT_MODIFIED {
            if let Some(cached) = self.cache.body(method.as_str(), url.as_str()) {
                metrics::record_conditional_cache("hit");
                debug!(url = %url, "304 Not Modified - serving cached value");
                return Ok(cached);
            }
            // Validator was sent but the value is gone; treat as upstream
            // inconsistency so the retry layer refetches unconditionally.
            metrics::record_conditional_cache("stale");
            self.cache.invalidate(method.as_str(), url.as_str());
            return Err(MeshError::upstream("304 received without a cached value")
                .with_status(status.as_u16())
                .with_context("url", &url));
        }

        let bytes = response.bytes().await?;

        if status.is_client_error() || status.is_server_error() {
            return Err(error_from_response(status, &bytes, &url));
        }

        if let Some(etag) = etag {
            self.cache
                .store(method.as_str(), url.as_str(), etag, bytes.to_vec());
        }

        Ok(bytes.to_vec())
    }

    pub fn cache(&self) -> &ConditionalCache {
        &self.cache
    }
}

fn method_label(method: &Method) -> &'static str {
    match method.as_str() {
        "GET" => "GET",
        "POST" => "POST",
        "PUT" => "PUT",
        "PATCH" => "PATCH",
        "DELETE" => "DELETE",
        _ => "OTHER",
    }
}

/// Maps an error response to a typed domain error, preserving the upstream
/// envelope message when the body carries one.
pub(crate) fn error_from_response(status: StatusCode, body: &[u8], url: &Url) -> MeshError {
    let envelope: Option<ErrorEnvelope> = serde_json::from_slice(body).ok();
    let message = envelope
        .as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

    let kind = match status.as_u16() {
        401 => ErrorKind::Unauthorized,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        422 => ErrorKind::Validation,
        429 => ErrorKind::RateLimitExceeded,
        500..=599 => ErrorKind::Upstream,
        _ => ErrorKind::Upstream,
    };

    if status.is_server_error() {
        warn!(status = status.as_u16(), url = %url, "Upstream server error");
    }

    let mut err = MeshError::new(kind, message)
        .with_status(status.as_u16())
        .with_context("url", url);
    if let Some(doc) = envelope.and_then(|e| e.documentation_url) {
        err = err.with_context("documentation_url", doc);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenProvider;
    use crate::resilience::{BulkheadConfig, CircuitBreakerConfig, RateLimiterConfig};

    fn client(base: &str) -> RestClient {
        let auth = Arc::new(ContextAwareProvider::new(Arc::new(TokenProvider::new(
            "test-token",
        ))));
        RestClient::new(
            RestClientConfig {
                base_url: base.to_string(),
                ..Default::default()
            },
            auth,
            Arc::new(AdaptiveRateLimiter::new(
                "rest-test",
                RateLimiterConfig {
                    requests_per_second: 1_000.0,
                    burst: 1_000,
                    max_wait: std::time::Duration::from_secs(1),
                },
            )),
            Arc::new(Bulkhead::new("rest-test", BulkheadConfig::default())),
            Arc::new(CircuitBreaker::new(
                "rest-test",
                CircuitBreakerConfig::default(),
            )),
            RetryPolicy::no_retry(),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let c = client("https://api.test");
        assert_eq!(
            c.resolve_url("/repos/o/r").unwrap().as_str(),
            "https://api.test/repos/o/r"
        );
        assert_eq!(
            c.resolve_url("repos/o/r").unwrap().as_str(),
            "https://api.test/repos/o/r"
        );
        assert_eq!(
            c.resolve_url("https://elsewhere.test/x").unwrap().as_str(),
            "https://elsewhere.test/x"
        );
    }

    #[test]
    fn test_error_envelope_mapping() {
        let url = Url::parse("https://api.test/repos/o/r").unwrap();
        let body = br#"{"message": "Not Found", "documentation_url": "https://docs.test"}"#;

        let err = error_from_response(StatusCode::NOT_FOUND, body, &url);
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "Not Found");
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(
            err.context.get("documentation_url").map(String::as_str),
            Some("https://docs.test")
        );
    }

    #[test]
    fn test_error_mapping_by_status() {
        let url = Url::parse("https://api.test/x").unwrap();
        let cases = [
            (401, ErrorKind::Unauthorized),
            (403, ErrorKind::Forbidden),
            (409, ErrorKind::Conflict),
            (422, ErrorKind::Validation),
            (429, ErrorKind::RateLimitExceeded),
            (500, ErrorKind::Upstream),
            (503, ErrorKind::Upstream),
        ];
        for (status, kind) in cases {
            let err = error_from_response(
                StatusCode::from_u16(status).unwrap(),
                b"plain body",
                &url,
            );
            assert_eq!(err.kind, kind, "status {}", status);
            assert_eq!(err.message, "plain body");
        }
    }
}
