//! Inbound bearer token verification
//!
//! Tokens presented to this server are checked either by RFC 7662
//! introspection against the authorization server or by local JWT
//! validation against its JWKS. The strategy is fixed at construction.
//! Audience and required scopes are enforced the same way for both.

mod introspection;
mod jwt;

pub use introspection::IntrospectionVerifier;
pub use jwt::{JwksCache, JwtVerifier};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{AuthConfig, VerifierMode};
use crate::oauth::AuthorizationServerMetadata;
use crate::{Error, Result};

/// Identity extracted from an accepted bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedToken {
    /// The presented token
    #[serde(skip_serializing)]
    pub token: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Expiry (epoch seconds)
    pub expires_at: Option<u64>,
    /// Audiences the token is valid for
    pub audience: Vec<String>,
    /// Resource owner
    pub subject: Option<String>,
}

/// Resolved verifier settings
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    /// Verification strategy
    pub mode: VerifierMode,
    /// Discovery URL for authorization server metadata
    pub metadata_url: Option<String>,
    /// Inline metadata (takes precedence over discovery)
    pub metadata: Option<AuthorizationServerMetadata>,
    /// Expected audience
    pub audience: Option<String>,
    /// Scopes every token must carry
    pub required_scopes: Vec<String>,
    /// Introspection client ID
    pub client_id: Option<String>,
    /// Introspection client secret
    pub client_secret: Option<String>,
    /// Accepted JWT algorithms
    pub algorithms: Vec<Algorithm>,
    /// JWKS freshness
    pub jwks_cache_ttl: Duration,
    /// Refuse plain-HTTP authorization server URLs
    pub require_https: bool,
    /// Timeout for authorization server calls
    pub timeout: Duration,
}

impl VerifierSettings {
    /// Resolve settings from the `auth` config section
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unknown algorithm names.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let algorithms = config
            .algorithms
            .iter()
            .map(|name| {
                Algorithm::from_str(name)
                    .map_err(|_| Error::Config(format!("Unsupported JWT algorithm: {name}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mode: config.mode,
            metadata_url: config.metadata_url.clone(),
            metadata: config.metadata.clone(),
            audience: config.audience.clone(),
            required_scopes: config.required_scopes.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            algorithms,
            jwks_cache_ttl: config.jwks_cache_ttl,
            require_https: config.require_https,
            timeout: config.timeout,
        })
    }
}

/// How tokens are checked
pub enum VerificationStrategy {
    /// RFC 7662 introspection
    Introspection(IntrospectionVerifier),
    /// Local JWT validation
    JwtValidation(JwtVerifier),
}

impl VerificationStrategy {
    async fn verify(&self, token: &str, metadata: &AuthorizationServerMetadata) -> Result<VerifiedToken> {
        match self {
            Self::Introspection(v) => v.verify(token, metadata).await,
            Self::JwtValidation(v) => v.verify(token, metadata).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Introspection(_) => "introspection",
            Self::JwtValidation(_) => "jwt",
        }
    }
}

/// Verifies bearer tokens presented to this server
pub struct BearerTokenVerifier {
    settings: VerifierSettings,
    http: Client,
    strategy: VerificationStrategy,
    metadata: RwLock<Option<Arc<AuthorizationServerMetadata>>>,
}

impl BearerTokenVerifier {
    /// Create a verifier; call [`Self::initialize`] before verifying
    pub fn new(settings: VerifierSettings) -> Result<Self> {
        let http = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self::with_client(http, settings))
    }

    /// Create a verifier using an existing HTTP client
    #[must_use]
    pub fn with_client(http: Client, settings: VerifierSettings) -> Self {
        let strategy = match settings.mode {
            VerifierMode::Introspection => VerificationStrategy::Introspection(
                IntrospectionVerifier::new(
                    http.clone(),
                    settings.client_id.clone(),
                    settings.client_secret.clone(),
                ),
            ),
            VerifierMode::Jwt => VerificationStrategy::JwtValidation(JwtVerifier::new(
                JwksCache::new(http.clone(), settings.jwks_cache_ttl),
                settings.algorithms.clone(),
            )),
        };
        Self {
            settings,
            http,
            strategy,
            metadata: RwLock::new(None),
        }
    }

    /// Load authorization server metadata (inline or discovered)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if metadata is unavailable or lacks the
    /// endpoint the strategy needs.
    pub async fn initialize(&self) -> Result<()> {
        let metadata = match (&self.settings.metadata, &self.settings.metadata_url) {
            (Some(inline), _) => inline.clone(),
            (None, Some(url)) => {
                self.ensure_https("metadata_url", url)?;
                AuthorizationServerMetadata::discover(&self.http, url).await?
            }
            (None, None) => {
                return Err(Error::Config(
                    "Token verification needs auth.metadata or auth.metadata_url".to_string(),
                ));
            }
        };

        let (field, endpoint) = match self.strategy {
            VerificationStrategy::Introspection(_) => {
                ("introspection_endpoint", &metadata.introspection_endpoint)
            }
            VerificationStrategy::JwtValidation(_) => ("jwks_uri", &metadata.jwks_uri),
        };
        let endpoint = endpoint.as_deref().ok_or_else(|| {
            Error::Config(format!("Authorization server metadata has no {field}"))
        })?;
        self.ensure_https(field, endpoint)?;

        info!(
            issuer = %metadata.issuer,
            strategy = self.strategy.name(),
            "Bearer token verifier initialized"
        );
        *self.metadata.write() = Some(Arc::new(metadata));
        Ok(())
    }

    /// Verify a presented token
    ///
    /// # Errors
    ///
    /// `InvalidToken` for inactive, malformed or foreign tokens,
    /// `InsufficientScope` when required scopes are missing and `Config`
    /// when called before [`Self::initialize`].
    pub async fn verify_token(&self, token: &str) -> Result<VerifiedToken> {
        let metadata = self.metadata.read().clone().ok_or_else(|| {
            Error::Config("Bearer token verifier used before initialization".to_string())
        })?;

        let verified = self.strategy.verify(token, &metadata).await?;

        if let Some(expected) = &self.settings.audience {
            if !verified.audience.iter().any(|aud| audience_matches(aud, expected)) {
                debug!(expected = %expected, "Token audience mismatch");
                return Err(Error::InvalidToken("audience mismatch".to_string()));
            }
        }

        let missing = missing_scopes(&self.settings.required_scopes, &verified.scopes);
        if !missing.is_empty() {
            return Err(Error::InsufficientScope {
                required: self.settings.required_scopes.clone(),
                provided: verified.scopes,
                missing,
            });
        }

        Ok(verified)
    }

    /// Loaded metadata, if initialized
    #[must_use]
    pub fn metadata(&self) -> Option<Arc<AuthorizationServerMetadata>> {
        self.metadata.read().clone()
    }

    /// Scopes every token must carry
    #[must_use]
    pub fn required_scopes(&self) -> &[String] {
        &self.settings.required_scopes
    }

    fn ensure_https(&self, field: &str, url: &str) -> Result<()> {
        if self.settings.require_https && !url.starts_with("https://") {
            return Err(Error::Config(format!(
                "{field} must use HTTPS (got {url}); set auth.require_https: false for local testing"
            )));
        }
        Ok(())
    }
}

/// Compare audiences ignoring a trailing slash
#[must_use]
pub fn audience_matches(actual: &str, expected: &str) -> bool {
    actual.trim_end_matches('/') == expected.trim_end_matches('/')
}

/// Required scopes absent from the granted set
#[must_use]
pub fn missing_scopes(required: &[String], granted: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|scope| !granted.contains(scope))
        .cloned()
        .collect()
}

/// A claim that may be a single string or a list of strings
fn string_or_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// A scope claim: space-delimited string or list
fn scope_claim(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(s) => Some(s.split_whitespace().map(String::from).collect()),
        Value::Array(_) => Some(string_or_list(value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audience_ignores_trailing_slash() {
        assert!(audience_matches("https://x", "https://x/"));
        assert!(audience_matches("https://x/", "https://x"));
        assert!(!audience_matches("https://x", "https://y"));
    }

    #[test]
    fn missing_scopes_lists_absent_ones() {
        let required = vec!["A".to_string(), "C".to_string()];
        let granted = vec!["A".to_string(), "B".to_string()];
        assert_eq!(missing_scopes(&required, &granted), vec!["C"]);
        assert!(missing_scopes(&[], &granted).is_empty());
    }

    #[test]
    fn scope_claim_accepts_string_and_array() {
        assert_eq!(scope_claim(&json!("a b")), Some(vec!["a".into(), "b".into()]));
        assert_eq!(scope_claim(&json!(["a", "b"])), Some(vec!["a".into(), "b".into()]));
        assert_eq!(scope_claim(&json!(42)), None);
    }

    #[test]
    fn settings_reject_unknown_algorithm() {
        let config = AuthConfig {
            algorithms: vec!["RS256".to_string(), "none".to_string()],
            ..AuthConfig::default()
        };
        assert!(matches!(
            VerifierSettings::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn verify_before_initialize_is_config_error() {
        let settings = VerifierSettings::from_config(&AuthConfig::default()).unwrap();
        let verifier = BearerTokenVerifier::new(settings).unwrap();
        let err = verifier.verify_token("abc").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn initialize_requires_https_endpoints() {
        let config = AuthConfig {
            metadata: Some(AuthorizationServerMetadata {
                issuer: "http://auth.local".to_string(),
                introspection_endpoint: Some("http://auth.local/introspect".to_string()),
                ..AuthorizationServerMetadata::default()
            }),
            ..AuthConfig::default()
        };
        let verifier =
            BearerTokenVerifier::new(VerifierSettings::from_config(&config).unwrap()).unwrap();
        assert!(matches!(verifier.initialize().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn initialize_requires_strategy_endpoint() {
        let config = AuthConfig {
            mode: VerifierMode::Jwt,
            metadata: Some(AuthorizationServerMetadata {
                issuer: "https://auth.example.com".to_string(),
                ..AuthorizationServerMetadata::default()
            }),
            ..AuthConfig::default()
        };
        let verifier =
            BearerTokenVerifier::new(VerifierSettings::from_config(&config).unwrap()).unwrap();
        let err = verifier.initialize().await.unwrap_err();
        assert!(err.to_string().contains("jwks_uri"));
    }
}
