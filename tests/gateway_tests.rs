//! Outbound gateway tests: throttle, retries, error normalization

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use marketplace_mcp::api::{ApiGateway, ApiRequest};
use marketplace_mcp::config::{ApiConfig, RateLimitConfig, RetryConfig};
use marketplace_mcp::oauth::TokenSource;
use marketplace_mcp::{Error, Result};
use reqwest::Method;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct StaticToken(Option<&'static str>);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        self.0
            .map(String::from)
            .ok_or_else(|| Error::AuthExpired("refresh token expired".to_string()))
    }
}

fn api_config(max_requests: usize) -> ApiConfig {
    ApiConfig {
        timeout: Duration::from_secs(5),
        rate_limit: RateLimitConfig {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests,
        },
        retry: RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
            ..RetryConfig::default()
        },
        default_headers: HashMap::from([(
            "X-EBAY-C-MARKETPLACE-ID".to_string(),
            "EBAY_US".to_string(),
        )]),
    }
}

fn gateway(base_url: &str) -> ApiGateway {
    ApiGateway::new(base_url, &api_config(100), Arc::new(StaticToken(Some("tok")))).unwrap()
}

#[tokio::test]
async fn sends_bearer_token_and_default_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sell/inventory/v1/inventory_item"))
        .and(header("authorization", "Bearer tok"))
        .and(header("x-ebay-c-marketplace-id", "EBAY_US"))
        .and(query_param("limit", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total": 0})))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let body: Value = api
        .get("/sell/inventory/v1/inventory_item", &[("limit", "10")])
        .await
        .unwrap();
    assert_eq!(body, json!({"total": 0}));
}

#[tokio::test]
async fn empty_success_body_is_null() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/sell/inventory/v1/inventory_item/SKU-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let body: Value = api
        .delete("/sell/inventory/v1/inventory_item/SKU-1")
        .await
        .unwrap();
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sell/account/v1/privilege"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sell/account/v1/privilege"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sellingLimit": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let body: Value = api.get("/sell/account/v1/privilege", &[]).await.unwrap();
    assert_eq!(body, json!({"sellingLimit": {}}));
}

#[tokio::test]
async fn retry_budget_exhaustion_is_upstream_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sell/account/v1/privilege"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let err = api
        .get::<Value>("/sell/account/v1/privilege", &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UpstreamUnavailable {
            attempts: 4,
            status: 503
        }
    ));
}

#[tokio::test]
async fn upstream_429_uses_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/buy/browse/v1/item_summary/search"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "45"))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let err = api
        .get::<Value>("/buy/browse/v1/item_summary/search", &[("q", "drone")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::RateLimited {
            retry_after_secs: 45,
            local: false
        }
    ));
}

#[tokio::test]
async fn upstream_429_without_header_defaults_to_sixty_seconds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let err = api.get::<Value>("/any", &[]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::RateLimited {
            retry_after_secs: 60,
            local: false
        }
    ));
}

#[tokio::test]
async fn client_error_is_rejected_with_long_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sell/inventory/v1/offer"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{
                "errorId": 25707,
                "message": "Invalid SKU",
                "longMessage": "This is an invalid value for a SKU."
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let err = api
        .get::<Value>("/sell/inventory/v1/offer", &[("sku", "?")])
        .await
        .unwrap_err();
    match err {
        Error::RequestRejected { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "This is an invalid value for a SKU.");
        }
        other => panic!("expected RequestRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn client_error_without_body_uses_reason_phrase() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let err = api.get::<Value>("/missing", &[]).await.unwrap_err();
    match err {
        Error::RequestRejected { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "Not Found");
        }
        other => panic!("expected RequestRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn full_local_window_rejects_without_network_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let api = ApiGateway::new(
        &server.uri(),
        &api_config(2),
        Arc::new(StaticToken(Some("tok"))),
    )
    .unwrap();

    api.get::<Value>("/a", &[]).await.unwrap();
    api.get::<Value>("/b", &[]).await.unwrap();
    let err = api.get::<Value>("/c", &[]).await.unwrap_err();
    match err {
        Error::RateLimited {
            retry_after_secs,
            local,
        } => {
            assert!(local);
            assert!(retry_after_secs > 0 && retry_after_secs <= 60);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    let status = api.rate_limit_status();
    assert_eq!(status.local.used, 2);
    assert_eq!(status.local.limit, 2);
}

#[tokio::test]
async fn post_without_idempotency_key_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sell/inventory/v1/offer"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let err = api
        .post::<Value>("/sell/inventory/v1/offer", json!({"sku": "SKU-1"}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UpstreamUnavailable {
            attempts: 1,
            status: 500
        }
    ));
}

#[tokio::test]
async fn post_with_idempotency_key_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sell/inventory/v1/offer"))
        .and(header("idempotency-key", "k-1"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sell/inventory/v1/offer"))
        .and(header("idempotency-key", "k-1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"offerId": "1"})))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let request = ApiRequest::new(Method::POST, "/sell/inventory/v1/offer")
        .json(json!({"sku": "SKU-1"}))
        .header("Idempotency-Key", "k-1")
        .unwrap();
    let body: Value = api.execute(request).await.unwrap();
    assert_eq!(body["offerId"], "1");
}

#[tokio::test]
async fn connection_failures_become_network_error() {
    // Nothing listens on port 1
    let api = gateway("http://127.0.0.1:1");
    let err = api.get::<Value>("/any", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Network { attempts: 4, .. }));
}

#[tokio::test]
async fn truncated_success_body_is_retried_as_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let accepted = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            // Promise 100 bytes, send four, then hang up
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"a\"",
                )
                .await;
            let _ = socket.shutdown().await;
        }
    });

    let api = gateway(&format!("http://{addr}"));
    let err = api.get::<Value>("/any", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Network { attempts: 4, .. }));
    assert_eq!(connections.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn malformed_success_body_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("{not json", "application/json"))
        .expect(1)
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    let err = api.get::<Value>("/any", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

#[tokio::test]
async fn token_failure_short_circuits_the_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let api = ApiGateway::new(&server.uri(), &api_config(100), Arc::new(StaticToken(None))).unwrap();
    let err = api.get::<Value>("/any", &[]).await.unwrap_err();
    assert!(matches!(err, Error::AuthExpired(_)));
}

#[tokio::test]
async fn success_records_upstream_rate_limit_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-RateLimit-Remaining", "4999")
                .set_body_json(json!({})),
        )
        .mount(&server)
        .await;

    let api = gateway(&server.uri());
    assert!(api.rate_limit_status().upstream.is_none());
    api.get::<Value>("/any", &[]).await.unwrap();

    let upstream = api.rate_limit_status().upstream.unwrap();
    assert_eq!(
        upstream.headers.get("x-ratelimit-remaining").map(String::as_str),
        Some("4999")
    );
}
