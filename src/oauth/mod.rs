//! OAuth 2.0 support
//!
//! - Outbound token lifecycle: user token with refresh, application token
//!   fallback, authorization-code exchange
//! - Authorization server metadata (RFC 8414)
//! - Protected resource metadata (RFC 9728)

mod manager;
mod metadata;
mod store;

pub use manager::{OAuthSettings, OAuthTokenManager, TOKEN_PATH, TokenInfo};
pub use metadata::{AuthorizationServerMetadata, ProtectedResourceMetadata};
pub use store::{AppTokenRecord, TokenRecord, TokenStore, expiry_after, now_ms};

pub(crate) use metadata::deserialize_scopes;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::Result;

/// Anything that can hand out a currently valid outbound access token
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Get a valid token, refreshing or re-granting as needed
    async fn access_token(&self) -> Result<String>;
}

/// `Authorization` header value for client authentication (RFC 6749 §2.3.1)
pub(crate) fn basic_credentials(client_id: &str, client_secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{client_secret}")))
}
