//! RFC 7662 token introspection

use reqwest::Client;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{VerifiedToken, string_or_list};
use crate::oauth::{AuthorizationServerMetadata, basic_credentials, deserialize_scopes};
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_scopes")]
    scope: Vec<String>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    aud: Option<Value>,
    #[serde(default)]
    sub: Option<String>,
}

/// Asks the authorization server whether a token is active
pub struct IntrospectionVerifier {
    http: Client,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl IntrospectionVerifier {
    /// Create a verifier, optionally authenticating to the endpoint
    #[must_use]
    pub fn new(http: Client, client_id: Option<String>, client_secret: Option<String>) -> Self {
        Self {
            http,
            client_id,
            client_secret,
        }
    }

    pub(super) async fn verify(
        &self,
        token: &str,
        metadata: &AuthorizationServerMetadata,
    ) -> Result<VerifiedToken> {
        let endpoint = metadata.introspection_endpoint.as_deref().ok_or_else(|| {
            Error::Config("Authorization server metadata has no introspection_endpoint".to_string())
        })?;

        let mut request = self.http.post(endpoint).form(&[("token", token)]);
        if let Some(client_id) = &self.client_id {
            let secret = self.client_secret.as_deref().unwrap_or_default();
            request = request.header(AUTHORIZATION, basic_credentials(client_id, secret));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "Introspection endpoint rejected request");
            return Err(Error::InvalidToken(format!(
                "introspection failed with HTTP {}",
                status.as_u16()
            )));
        }

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| Error::InvalidToken(format!("malformed introspection response: {e}")))?;

        if !body.active {
            return Err(Error::InvalidToken("token is not active".to_string()));
        }

        Ok(VerifiedToken {
            token: token.to_string(),
            client_id: body.client_id.unwrap_or_default(),
            scopes: body.scope,
            expires_at: body.exp,
            audience: body.aud.as_ref().map(string_or_list).unwrap_or_default(),
            subject: body.sub,
        })
    }
}
