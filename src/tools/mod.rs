//! MCP tools exposed by this server
//!
//! `api_request` is the single generic entry point to the marketplace REST
//! API; the `oauth_*` tools drive the outbound token lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::api::{ApiGateway, ApiRequest};
use crate::oauth::{OAuthTokenManager, expiry_after, now_ms};
use crate::protocol::{Tool, ToolAnnotations, ToolsCallParams, ToolsCallResult};
use crate::{Error, Result};

/// HTTP methods accepted by `api_request`
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum HttpMethod {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "delete")]
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Self::GET,
            HttpMethod::Post => Self::POST,
            HttpMethod::Put => Self::PUT,
            HttpMethod::Delete => Self::DELETE,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiRequestArgs {
    method: HttpMethod,
    path: String,
    #[serde(default)]
    query: BTreeMap<String, Value>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthorizationUrlArgs {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeCodeArgs {
    code: String,
}

#[derive(Debug, Deserialize)]
struct SetUserTokensArgs {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Seconds until the access token expires
    #[serde(default)]
    access_token_expires_in: Option<u64>,
    /// Seconds until the refresh token expires
    #[serde(default)]
    refresh_token_expires_in: Option<u64>,
}

/// Dispatches `tools/call` requests
pub struct ToolRegistry {
    tokens: Arc<OAuthTokenManager>,
    api: Arc<ApiGateway>,
}

impl ToolRegistry {
    /// Create a registry over the token manager and API gateway
    #[must_use]
    pub fn new(tokens: Arc<OAuthTokenManager>, api: Arc<ApiGateway>) -> Self {
        Self { tokens, api }
    }

    /// Tool definitions for `tools/list`
    #[must_use]
    pub fn list(&self) -> Vec<Tool> {
        vec![
            Tool {
                name: "api_request".to_string(),
                description: Some(
                    "Call the marketplace REST API. Authentication, rate limiting and retries are handled by the server."
                        .to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "method": {"type": "string", "enum": ["GET", "POST", "PUT", "DELETE"]},
                        "path": {"type": "string", "description": "Path relative to the API base URL, e.g. /sell/inventory/v1/inventory_item"},
                        "query": {"type": "object", "additionalProperties": true},
                        "body": {"description": "JSON request body"},
                        "headers": {"type": "object", "additionalProperties": {"type": "string"}}
                    },
                    "required": ["method", "path"]
                }),
                annotations: Some(ToolAnnotations {
                    open_world_hint: Some(true),
                    ..ToolAnnotations::default()
                }),
            },
            Tool {
                name: "oauth_authorization_url".to_string(),
                description: Some("Build the user consent URL for the authorization-code flow".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"state": {"type": "string"}}
                }),
                annotations: Some(ToolAnnotations::read_only()),
            },
            Tool {
                name: "oauth_exchange_code".to_string(),
                description: Some("Exchange an authorization code for user tokens".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"code": {"type": "string"}},
                    "required": ["code"]
                }),
                annotations: None,
            },
            Tool {
                name: "oauth_set_user_tokens".to_string(),
                description: Some("Install user tokens obtained elsewhere".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "access_token": {"type": "string"},
                        "refresh_token": {"type": "string"},
                        "access_token_expires_in": {"type": "integer", "minimum": 0},
                        "refresh_token_expires_in": {"type": "integer", "minimum": 0}
                    },
                    "required": ["access_token"]
                }),
                annotations: None,
            },
            Tool {
                name: "oauth_token_info".to_string(),
                description: Some("Show token state and expiries (never token values)".to_string()),
                input_schema: json!({"type": "object", "properties": {}}),
                annotations: Some(ToolAnnotations::read_only()),
            },
            Tool {
                name: "oauth_clear_tokens".to_string(),
                description: Some("Discard all cached tokens".to_string()),
                input_schema: json!({"type": "object", "properties": {}}),
                annotations: Some(ToolAnnotations {
                    destructive_hint: Some(true),
                    ..ToolAnnotations::default()
                }),
            },
            Tool {
                name: "api_rate_limits".to_string(),
                description: Some("Show local rate window usage and the last upstream rate limit headers".to_string()),
                input_schema: json!({"type": "object", "properties": {}}),
                annotations: Some(ToolAnnotations::read_only()),
            },
        ]
    }

    /// Run a tool
    ///
    /// Domain failures become error results (`isError: true`); only an
    /// unknown tool name is returned as `Err`.
    pub async fn call(&self, params: ToolsCallParams) -> Result<ToolsCallResult> {
        let ToolsCallParams { name, arguments } = params;
        let arguments = if arguments.is_null() { json!({}) } else { arguments };

        let outcome = match name.as_str() {
            "api_request" => self.api_request(arguments).await,
            "oauth_authorization_url" => self.authorization_url(arguments),
            "oauth_exchange_code" => self.exchange_code(arguments).await,
            "oauth_set_user_tokens" => self.set_user_tokens(arguments),
            "oauth_token_info" => to_value(&self.tokens.token_info()),
            "oauth_clear_tokens" => {
                self.tokens.clear_all_tokens();
                Ok(json!({"cleared": true}))
            }
            "api_rate_limits" => to_value(&self.api.rate_limit_status()),
            _ => return Err(Error::Protocol(format!("Unknown tool: {name}"))),
        };

        Ok(match outcome {
            Ok(value) => ToolsCallResult::json(&value),
            Err(e) => {
                debug!(tool = %name, error = %e, "Tool call failed");
                ToolsCallResult::error(&e.to_tool_error())
            }
        })
    }

    async fn api_request(&self, arguments: Value) -> Result<Value> {
        let args: ApiRequestArgs = serde_json::from_value(arguments)?;

        let mut request = ApiRequest::new(args.method.into(), args.path);
        for (key, value) in args.query {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            request = request.query(key, value);
        }
        for (name, value) in &args.headers {
            request = request.header(name, value)?;
        }
        if let Some(body) = args.body {
            request = request.json(body);
        }

        self.api.execute(request).await
    }

    fn authorization_url(&self, arguments: Value) -> Result<Value> {
        let args: AuthorizationUrlArgs = serde_json::from_value(arguments)?;
        let state = args.state.unwrap_or_else(|| Uuid::new_v4().to_string());
        let url = self.tokens.authorization_url(Some(&state))?;
        Ok(json!({"authorization_url": url, "state": state}))
    }

    async fn exchange_code(&self, arguments: Value) -> Result<Value> {
        let args: ExchangeCodeArgs = serde_json::from_value(arguments)?;
        let info = self.tokens.exchange_code_for_token(args.code.trim()).await?;
        to_value(&info)
    }

    fn set_user_tokens(&self, arguments: Value) -> Result<Value> {
        let args: SetUserTokensArgs = serde_json::from_value(arguments)?;
        let now = now_ms();
        let expiry = |secs: u64| expiry_after(now, std::time::Duration::from_secs(secs));
        self.tokens.set_user_tokens(
            args.access_token,
            args.refresh_token,
            args.access_token_expires_in.map(expiry),
            args.refresh_token_expires_in.map(expiry),
        );
        to_value(&self.tokens.token_info())
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_accepts_either_case() {
        let args: ApiRequestArgs =
            serde_json::from_value(json!({"method": "get", "path": "/x"})).unwrap();
        assert!(matches!(args.method, HttpMethod::Get));
        let args: ApiRequestArgs =
            serde_json::from_value(json!({"method": "DELETE", "path": "/x"})).unwrap();
        assert!(matches!(args.method, HttpMethod::Delete));
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let result = serde_json::from_value::<ApiRequestArgs>(json!({"method": "TRACE", "path": "/x"}));
        assert!(result.is_err());
    }
}
