//! Resilient gateway for outbound marketplace REST calls
//!
//! Every call passes the local rate window, gets a bearer token from the
//! token source, and is retried on transient failures within the retry
//! budget. 429s and client errors are surfaced immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::failsafe::{RateWindow, RateWindowSnapshot, RetryPolicy, is_retryable_status};
use crate::oauth::{TokenSource, now_ms};
use crate::{Error, Result};

/// Wait reported for a 429 without a usable `Retry-After`
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const RATE_LIMIT_HEADER_PREFIX: &str = "x-ratelimit-";

/// A single outbound call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    headers: HeaderMap,
}

impl ApiRequest {
    /// New request for a path relative to the API base URL
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    /// Add a query parameter
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set the JSON body
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a request header
    ///
    /// # Errors
    ///
    /// Rejects malformed headers and attempts to set `Authorization`.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::Protocol(format!("Invalid header name: {name}")))?;
        if name == AUTHORIZATION {
            return Err(Error::Protocol(
                "The Authorization header is managed by the server".to_string(),
            ));
        }
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Protocol(format!("Invalid value for header {name}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// HTTP method
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Relative path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Rate limit headers last reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamRateLimit {
    /// `x-ratelimit-*` headers by name
    pub headers: BTreeMap<String, String>,
    /// When they were observed (epoch ms)
    pub observed_at: u64,
}

/// Local and upstream rate limit state
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    /// Local sliding window
    pub local: RateWindowSnapshot,
    /// Last upstream telemetry, if any response carried it
    pub upstream: Option<UpstreamRateLimit>,
}

/// Platform error body: `{"errors": [{"message": .., "longMessage": ..}]}`
#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    errors: Vec<UpstreamError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    long_message: Option<String>,
}

/// Why an attempt failed in a retryable way
enum Transient {
    Status(StatusCode),
    Network(String),
}

impl Transient {
    fn into_error(self, attempts: u32) -> Error {
        match self {
            Self::Status(status) => Error::UpstreamUnavailable {
                attempts,
                status: status.as_u16(),
            },
            Self::Network(message) => Error::Network { attempts, message },
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Status(status) => format!("HTTP {}", status.as_u16()),
            Self::Network(message) => message.clone(),
        }
    }
}

/// Outbound REST gateway
pub struct ApiGateway {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    rate_window: RateWindow,
    retry: RetryPolicy,
    default_headers: HeaderMap,
    upstream_limits: RwLock<Option<UpstreamRateLimit>>,
}

impl ApiGateway {
    /// Create a gateway with its own HTTP client
    pub fn new(base_url: &str, config: &ApiConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Self::with_client(http, base_url, config, tokens)
    }

    /// Create a gateway using an existing HTTP client
    pub fn with_client(
        http: Client,
        base_url: &str,
        config: &ApiConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self> {
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            rate_window: RateWindow::new(&config.rate_limit),
            retry: RetryPolicy::new(&config.retry),
            default_headers: header_map(&config.default_headers)?,
            upstream_limits: RwLock::new(None),
        })
    }

    /// GET a path with query parameters
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let request = query
            .iter()
            .fold(ApiRequest::new(Method::GET, path), |req, (k, v)| req.query(*k, *v));
        self.execute(request).await
    }

    /// POST a JSON body
    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        self.execute(ApiRequest::new(Method::POST, path).json(body)).await
    }

    /// PUT a JSON body
    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        self.execute(ApiRequest::new(Method::PUT, path).json(body)).await
    }

    /// DELETE a path
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.execute(ApiRequest::new(Method::DELETE, path)).await
    }

    /// Execute a request through the rate window, token source and retry loop
    pub async fn execute<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let url = self.url(&request.path)?;

        if let Err(wait) = self.rate_window.try_acquire() {
            debug!(path = %request.path, wait_ms = wait.as_millis(), "Local rate window full");
            return Err(Error::RateLimited {
                retry_after_secs: ceil_secs(wait),
                local: true,
            });
        }

        let token = self.tokens.access_token().await?;

        let max_attempts = if self.retry.permits(&request.method, &request.headers) {
            self.retry.max_attempts()
        } else {
            1
        };
        let mut delays = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let failure = match self.send(&url, &request, &token).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        self.record_upstream_limits(response.headers());
                        // A body cut off mid-read is retried like a failed send
                        match response.bytes().await {
                            Ok(bytes) => return parse_body(&bytes),
                            Err(e) => Transient::Network(e.to_string()),
                        }
                    } else {
                        if status == StatusCode::TOO_MANY_REQUESTS {
                            return Err(Error::RateLimited {
                                retry_after_secs: retry_after(response.headers()),
                                local: false,
                            });
                        }
                        if !is_retryable_status(status) {
                            return Err(rejection(status, response).await);
                        }
                        Transient::Status(status)
                    }
                }
                Err(e) => Transient::Network(e.to_string()),
            };

            if attempt >= max_attempts {
                return Err(failure.into_error(attempt));
            }

            let delay = delays.next().unwrap_or(self.retry.max_backoff);
            warn!(
                method = %request.method,
                path = %request.path,
                attempt,
                delay_ms = delay.as_millis(),
                reason = %failure.describe(),
                "Transient upstream failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Local window usage and the last upstream rate limit headers
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        RateLimitStatus {
            local: self.rate_window.snapshot(),
            upstream: self.upstream_limits.read().clone(),
        }
    }

    async fn send(
        &self,
        url: &str,
        request: &ApiRequest,
        token: &str,
    ) -> std::result::Result<Response, reqwest::Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(self.default_headers.clone())
            .headers(request.headers.clone())
            .bearer_auth(token);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder.send().await
    }

    fn url(&self, path: &str) -> Result<String> {
        if path.contains("://") {
            return Err(Error::Protocol(format!(
                "Expected a path relative to the API base URL, got {path}"
            )));
        }
        if path.starts_with('/') {
            Ok(format!("{}{path}", self.base_url))
        } else {
            Ok(format!("{}/{path}", self.base_url))
        }
    }

    fn record_upstream_limits(&self, headers: &HeaderMap) {
        let limits: BTreeMap<String, String> = headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(RATE_LIMIT_HEADER_PREFIX))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        if !limits.is_empty() {
            *self.upstream_limits.write() = Some(UpstreamRateLimit {
                headers: limits,
                observed_at: now_ms(),
            });
        }
    }
}

fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::Config(format!("Invalid default header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::Config(format!("Invalid value for default header {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn parse_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let value = if bytes.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Protocol(format!("Upstream returned invalid JSON: {e}")))?
    };
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("Unexpected upstream response shape: {e}")))
}

async fn rejection(status: StatusCode, response: Response) -> Error {
    let body = response.text().await.unwrap_or_default();
    Error::RequestRejected {
        status: status.as_u16(),
        message: upstream_message(&body)
            .or_else(|| status.canonical_reason().map(String::from))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
    }
}

/// `errors[0].longMessage`, then `errors[0].message`
fn upstream_message(body: &str) -> Option<String> {
    let parsed: UpstreamErrorBody = serde_json::from_str(body).ok()?;
    let first = parsed.errors.into_iter().next()?;
    first
        .long_message
        .filter(|m| !m.is_empty())
        .or(first.message.filter(|m| !m.is_empty()))
}

fn retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn ceil_secs(wait: Duration) -> u64 {
    (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_message_preferred_over_message() {
        let body = r#"{"errors": [{"errorId": 25002, "message": "short", "longMessage": "long"}]}"#;
        assert_eq!(upstream_message(body).as_deref(), Some("long"));

        let body = r#"{"errors": [{"message": "short"}]}"#;
        assert_eq!(upstream_message(body).as_deref(), Some("short"));

        assert_eq!(upstream_message("not json"), None);
        assert_eq!(upstream_message(r#"{"errors": []}"#), None);
    }

    #[test]
    fn retry_after_defaults_to_sixty() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), 60);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("45"));
        assert_eq!(retry_after(&headers), 45);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), 60);
    }

    #[test]
    fn ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
    }

    #[test]
    fn request_rejects_authorization_header() {
        let err = ApiRequest::new(Method::GET, "/x")
            .header("Authorization", "Bearer other")
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let req = ApiRequest::new(Method::GET, "/x")
            .header("X-EBAY-C-MARKETPLACE-ID", "EBAY_US")
            .unwrap();
        assert!(req.headers.contains_key("x-ebay-c-marketplace-id"));
    }

    #[test]
    fn default_headers_are_validated() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        assert!(matches!(header_map(&headers), Err(Error::Config(_))));
    }
}
