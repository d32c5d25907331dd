//! Error types for the marketplace MCP server

use std::io;

use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Server errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing redirect URI, misconfigured verifier, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Both user token windows are exhausted; the user must re-authorize
    #[error(
        "User authorization expired: {0}. Re-run the OAuth authorization flow to obtain new tokens"
    )]
    AuthExpired(String),

    /// A grant call against the token endpoint failed
    #[error("Token grant failed ({grant}): {message}")]
    TokenGrant {
        /// Grant type that was attempted
        grant: &'static str,
        /// Reason reported by the token endpoint or transport
        message: String,
    },

    /// Inbound bearer token rejected
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Inbound bearer token lacks required scopes
    #[error("Insufficient scope: missing {}", missing.join(" "))]
    InsufficientScope {
        /// Scopes the server requires
        required: Vec<String>,
        /// Scopes carried by the token
        provided: Vec<String>,
        /// Required scopes absent from the token
        missing: Vec<String>,
    },

    /// Local rate window full or upstream 429
    #[error("Rate limited{}: retry after {retry_after_secs} seconds", if *local { " locally" } else { "" })]
    RateLimited {
        /// Seconds the caller should wait
        retry_after_secs: u64,
        /// True when the local rate window rejected the call
        local: bool,
    },

    /// Upstream 5xx retry budget exhausted
    #[error("Upstream unavailable after {attempts} attempt(s) (last status {status})")]
    UpstreamUnavailable {
        /// Attempts made
        attempts: u32,
        /// Last HTTP status observed
        status: u16,
    },

    /// Connectivity failure retry budget exhausted
    #[error("Network error after {attempts} attempt(s): {message}")]
    Network {
        /// Attempts made
        attempts: u32,
        /// Last transport error
        message: String,
    },

    /// Upstream rejected the request (4xx)
    #[error("Request rejected (HTTP {status}): {message}")]
    RequestRejected {
        /// HTTP status
        status: u16,
        /// Message extracted from the upstream error body
        message: String,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Json(_) => rpc_codes::INVALID_PARAMS,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::AuthExpired(_) | Self::InvalidToken(_) | Self::InsufficientScope { .. } => -32001,
            Self::RateLimited { .. } => -32002,
            Self::UpstreamUnavailable { .. } | Self::Network { .. } | Self::Http(_) => {
                rpc_codes::SERVER_ERROR_START
            }
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Stable machine-readable kind, used in tool error payloads
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::AuthExpired(_) => "auth_expired",
            Self::TokenGrant { .. } => "token_grant_failed",
            Self::InvalidToken(_) => "invalid_token",
            Self::InsufficientScope { .. } => "insufficient_scope",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::Network { .. } => "network_error",
            Self::RequestRejected { .. } => "request_rejected",
            Self::Protocol(_) => "protocol_error",
            Self::Io(_) | Self::Http(_) | Self::Internal(_) => "internal_error",
            Self::Json(_) => "invalid_arguments",
        }
    }

    /// Uniform payload returned to MCP clients when a tool call fails
    #[must_use]
    pub fn to_tool_error(&self) -> Value {
        let mut payload = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        match self {
            Self::RateLimited { retry_after_secs, .. } => {
                payload["retry_after_seconds"] = json!(retry_after_secs);
            }
            Self::UpstreamUnavailable { attempts, status } => {
                payload["attempts"] = json!(attempts);
                payload["status"] = json!(status);
            }
            Self::Network { attempts, .. } => {
                payload["attempts"] = json!(attempts);
            }
            Self::RequestRejected { status, .. } => {
                payload["status"] = json!(status);
            }
            _ => {}
        }
        payload
    }
}

/// Standard JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
}
