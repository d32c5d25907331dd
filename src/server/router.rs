//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::debug;

use super::auth::{AuthState, auth_middleware};
use crate::error::rpc_codes;
use crate::oauth::{OAuthTokenManager, ProtectedResourceMetadata};
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, RequestId, ServerCapabilities, ToolsCallParams,
    ToolsCapability, ToolsListResult, negotiate_version,
};
use crate::tools::ToolRegistry;

/// Shared application state
pub struct AppState {
    /// Tool dispatcher
    pub tools: ToolRegistry,
    /// Outbound token manager (health diagnostics)
    pub tokens: Arc<OAuthTokenManager>,
    /// Document served at `/.well-known/oauth-protected-resource`
    pub resource_metadata: ProtectedResourceMetadata,
    /// Inbound authentication
    pub auth: Arc<AuthState>,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth = Arc::clone(&state.auth);
    let max_body_size = state.max_body_size;

    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/.well-known/oauth-protected-resource",
            get(resource_metadata_handler),
        )
        .route("/mcp", post(mcp_handler))
        .layer(middleware::from_fn_with_state(auth, auth_middleware))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness plus outbound authorization state (no secrets)
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "user_authorized": state.tokens.is_authenticated(),
        "inbound_auth": state.auth.verifier.is_some()
    }))
}

/// RFC 9728 protected resource metadata
async fn resource_metadata_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.resource_metadata.clone())
}

/// MCP JSON-RPC endpoint (POST /mcp)
async fn mcp_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(JsonRpcResponse::error(
                    None,
                    rpc_codes::PARSE_ERROR,
                    format!("Invalid JSON: {e}"),
                )),
            )
                .into_response();
        }
    };

    let (id, method, params) = match parse_request(&request) {
        Ok(parsed) => parsed,
        Err(response) => return (StatusCode::BAD_REQUEST, Json(response)).into_response(),
    };

    let Some(id) = id else {
        debug!(method = %method, "Notification acknowledged");
        return StatusCode::ACCEPTED.into_response();
    };

    Json(dispatch(&state, id, &method, params).await).into_response()
}

async fn dispatch(
    state: &AppState,
    id: RequestId,
    method: &str,
    params: Option<Value>,
) -> JsonRpcResponse {
    match method {
        "initialize" => {
            let requested = params
                .as_ref()
                .and_then(|p| p.get("protocolVersion"))
                .and_then(Value::as_str);
            let result = InitializeResult {
                protocol_version: negotiate_version(requested).to_string(),
                capabilities: ServerCapabilities {
                    tools: Some(ToolsCapability {
                        list_changed: false,
                    }),
                },
                server_info: Info {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    title: Some("Marketplace MCP Server".to_string()),
                },
                instructions: Some(
                    "Use api_request for marketplace REST calls. If a call fails with auth_expired, run oauth_authorization_url and oauth_exchange_code."
                        .to_string(),
                ),
            };
            respond(id, &result)
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => respond(
            id,
            &ToolsListResult {
                tools: state.tools.list(),
            },
        ),
        "tools/call" => {
            let params: ToolsCallParams =
                match serde_json::from_value(params.unwrap_or(Value::Null)) {
                    Ok(p) => p,
                    Err(e) => {
                        return JsonRpcResponse::error(
                            Some(id),
                            rpc_codes::INVALID_PARAMS,
                            format!("Invalid tools/call params: {e}"),
                        );
                    }
                };
            match state.tools.call(params).await {
                Ok(result) => respond(id, &result),
                Err(e) => JsonRpcResponse::error(Some(id), rpc_codes::INVALID_PARAMS, e.to_string()),
            }
        }
        _ => JsonRpcResponse::error(
            Some(id),
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        ),
    }
}

fn respond<T: serde::Serialize>(id: RequestId, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(Some(id), rpc_codes::INTERNAL_ERROR, e.to_string()),
    }
}

/// Check whether a method name represents a notification (no response expected).
fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Parse JSON-RPC request or notification
/// Returns (Option<RequestId>, method, params) - id is None for notifications
#[allow(clippy::result_large_err)]
fn parse_request(
    value: &Value,
) -> Result<(Option<RequestId>, String, Option<Value>), JsonRpcResponse> {
    if value.is_array() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Batch requests are not supported",
        ));
    }

    let jsonrpc = value.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(RequestId::from_value);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method"))?;

    let params = value.get("params").cloned();

    if is_notification_method(method) {
        return Ok((None, method.to_string(), params));
    }
    if id.is_none() {
        return Err(JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Missing id"));
    }

    Ok((id, method.to_string(), params))
}
