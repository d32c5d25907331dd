//! OAuth Metadata
//!
//! RFC 8414 authorization server metadata (consumed by the bearer verifier)
//! and RFC 9728 protected resource metadata (served by this server).

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// OAuth Authorization Server Metadata (RFC 8414)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization server issuer URL
    pub issuer: String,

    /// Authorization endpoint URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// Token endpoint URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// Token introspection endpoint (RFC 7662)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    /// JSON Web Key Set URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Token revocation endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    /// Supported scopes (may be string or array due to implementation bugs)
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

/// OAuth Protected Resource Metadata (RFC 9728)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Protected resource identifier
    pub resource: String,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Supported bearer token methods
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,

    /// Supported scopes
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scopes_supported: Vec<String>,
}

/// Deserialize scopes that may be either a string or array.
/// Some servers return `"read write"` instead of `["read", "write"]`.
pub(crate) fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Ok(s.split_whitespace().map(String::from).collect()),
        Some(StringOrVec::Vec(v)) => Ok(v),
        None => Ok(Vec::new()),
    }
}

impl AuthorizationServerMetadata {
    /// Fetch metadata from a discovery URL
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata endpoint is unreachable or returns invalid data.
    pub async fn discover(client: &Client, discovery_url: &str) -> Result<Self> {
        debug!(url = %discovery_url, "Fetching authorization server metadata");

        let response = client
            .get(discovery_url)
            .send()
            .await
            .map_err(|e| Error::Config(format!("Failed to fetch OAuth metadata: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Config(format!(
                "OAuth metadata discovery failed: HTTP {}",
                response.status()
            )));
        }

        let metadata: Self = response
            .json()
            .await
            .map_err(|e| Error::Config(format!("Failed to parse OAuth metadata: {e}")))?;

        debug!(issuer = %metadata.issuer, "Discovered authorization server");
        Ok(metadata)
    }

    /// Derive the conventional discovery URL for an issuer
    #[must_use]
    pub fn well_known_url(issuer: &str) -> String {
        format!(
            "{}/.well-known/oauth-authorization-server",
            issuer.trim_end_matches('/')
        )
    }
}

impl ProtectedResourceMetadata {
    /// Metadata advertised for this server
    #[must_use]
    pub fn new(resource: String, authorization_server: Option<String>, scopes: Vec<String>) -> Self {
        Self {
            resource,
            authorization_servers: authorization_server.into_iter().collect(),
            bearer_methods_supported: vec!["header".to_string()],
            scopes_supported: scopes,
        }
    }

    /// Where clients find this document, relative to the resource URL
    #[must_use]
    pub fn document_url(resource: &str) -> String {
        format!(
            "{}/.well-known/oauth-protected-resource",
            resource.trim_end_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_accept_space_delimited_string() {
        let json = r#"{"issuer": "https://auth.example.com", "scopes_supported": "read write"}"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["read", "write"]);
    }

    #[test]
    fn scopes_accept_array_and_absence() {
        let json = r#"{"issuer": "https://a", "scopes_supported": ["x"]}"#;
        let meta: AuthorizationServerMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.scopes_supported, vec!["x"]);

        let meta: AuthorizationServerMetadata =
            serde_json::from_str(r#"{"issuer": "https://a"}"#).unwrap();
        assert!(meta.scopes_supported.is_empty());
        assert!(meta.introspection_endpoint.is_none());
    }

    #[test]
    fn well_known_url_handles_trailing_slash() {
        assert_eq!(
            AuthorizationServerMetadata::well_known_url("https://auth.example.com/"),
            "https://auth.example.com/.well-known/oauth-authorization-server"
        );
    }

    #[test]
    fn protected_resource_document_url() {
        assert_eq!(
            ProtectedResourceMetadata::document_url("https://mcp.example.com/"),
            "https://mcp.example.com/.well-known/oauth-protected-resource"
        );
    }

    #[test]
    fn protected_resource_serializes_header_method() {
        let meta = ProtectedResourceMetadata::new(
            "https://mcp.example.com".to_string(),
            Some("https://auth.example.com".to_string()),
            vec!["mcp:tools".to_string()],
        );
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["bearer_methods_supported"][0], "header");
        assert_eq!(json["authorization_servers"][0], "https://auth.example.com");
    }
}
