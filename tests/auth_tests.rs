//! Inbound bearer authentication through the HTTP router

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use marketplace_mcp::config::{AuthConfig, Config, VerifierMode};
use marketplace_mcp::oauth::AuthorizationServerMetadata;
use marketplace_mcp::server::Server;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PUBLIC_URL: &str = "https://mcp.example.com";

async fn authorization_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .and(body_string_contains("token=good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "active": true,
            "client_id": "inspector",
            "scope": "mcp:tools profile",
            "aud": PUBLIC_URL
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .and(body_string_contains("token=narrow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "active": true,
            "scope": "profile",
            "aud": PUBLIC_URL
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active": false})))
        .mount(&server)
        .await;
    server
}

async fn router(auth_server: &MockServer) -> Router {
    router_with_introspection(&auth_server.uri(), &format!("{}/introspect", auth_server.uri())).await
}

async fn router_with_introspection(issuer: &str, introspection_endpoint: &str) -> Router {
    let mut config = Config::default();
    config.server.public_url = Some(PUBLIC_URL.to_string());
    config.auth = AuthConfig {
        enabled: true,
        mode: VerifierMode::Introspection,
        metadata: Some(AuthorizationServerMetadata {
            issuer: issuer.to_string(),
            introspection_endpoint: Some(introspection_endpoint.to_string()),
            ..AuthorizationServerMetadata::default()
        }),
        audience: Some(PUBLIC_URL.to_string()),
        required_scopes: vec!["mcp:tools".to_string()],
        require_https: false,
        ..AuthConfig::default()
    };
    Server::new(config).await.unwrap().router()
}

fn mcp_request(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string(),
        ))
        .unwrap()
}

fn challenge(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_token_gets_challenge_without_error() {
    let auth_server = authorization_server().await;
    let response = router(&auth_server)
        .await
        .oneshot(mcp_request(None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = challenge(&response);
    assert!(challenge.starts_with("Bearer realm=\"marketplace-mcp\""));
    assert!(challenge.contains(
        "resource_metadata=\"https://mcp.example.com/.well-known/oauth-protected-resource\""
    ));
    assert!(!challenge.contains("error="));
}

#[tokio::test]
async fn invalid_token_gets_invalid_token_challenge() {
    let auth_server = authorization_server().await;
    let response = router(&auth_server)
        .await
        .oneshot(mcp_request(Some("revoked")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(challenge(&response).contains("error=\"invalid_token\""));
}

#[tokio::test]
async fn insufficient_scope_is_forbidden() {
    let auth_server = authorization_server().await;
    let response = router(&auth_server)
        .await
        .oneshot(mcp_request(Some("narrow")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let challenge = challenge(&response);
    assert!(challenge.contains("error=\"insufficient_scope\""));
    assert!(challenge.contains("scope=\"mcp:tools\""));

    let body = json_body(response).await;
    assert_eq!(body["error"], "insufficient_scope");
    assert_eq!(body["required_scopes"], json!(["mcp:tools"]));
    assert_eq!(body["provided_scopes"], json!(["profile"]));
}

#[tokio::test]
async fn valid_token_reaches_mcp_endpoint() {
    let auth_server = authorization_server().await;
    let response = router(&auth_server)
        .await
        .oneshot(mcp_request(Some("good")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], 1);
    assert!(body["result"]["tools"].as_array().unwrap().len() >= 7);
}

#[tokio::test]
async fn lowercase_bearer_scheme_is_accepted() {
    let auth_server = authorization_server().await;
    let mut request = mcp_request(None);
    request
        .headers_mut()
        .insert(header::AUTHORIZATION, "bearer good".parse().unwrap());

    let response = router(&auth_server).await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn public_paths_skip_authentication() {
    let auth_server = authorization_server().await;
    let app = router(&auth_server).await;

    let health = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["inbound_auth"], true);

    let metadata = app
        .oneshot(
            Request::get("/.well-known/oauth-protected-resource")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(metadata.status(), StatusCode::OK);
    let body = json_body(metadata).await;
    assert_eq!(body["resource"], PUBLIC_URL);
    assert_eq!(body["authorization_servers"], json!([auth_server.uri()]));
    assert_eq!(body["bearer_methods_supported"], json!(["header"]));
    assert_eq!(body["scopes_supported"], json!(["mcp:tools"]));
}

#[tokio::test]
async fn verifier_outage_is_a_server_error() {
    // Nothing listens on port 1
    let app = router_with_introspection("http://127.0.0.1:1", "http://127.0.0.1:1/introspect").await;

    let response = app.oneshot(mcp_request(Some("good"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"], "server_error");
}
