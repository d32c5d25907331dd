//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::oauth::AuthorizationServerMetadata;
use crate::{Error, Result};

/// Environment variable prefix (nested keys use `__`)
pub const ENV_PREFIX: &str = "MARKETPLACE_MCP_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `env:` references.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Remote platform endpoints and application credentials
    pub platform: PlatformConfig,
    /// Outbound token lifecycle
    pub oauth: OAuthConfig,
    /// Outbound API gateway behaviour
    pub api: ApiConfig,
    /// Inbound bearer token verification
    pub auth: AuthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Public base URL of this server (used for protected resource metadata)
    pub public_url: Option<String>,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            public_url: None,
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Public URL, falling back to the bind address
    #[must_use]
    pub fn resource_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

/// Platform environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformEnvironment {
    /// Live marketplace
    #[default]
    Production,
    /// Sandbox marketplace
    Sandbox,
}

impl PlatformEnvironment {
    /// Default REST/identity base URL
    #[must_use]
    pub fn api_base_url(self) -> &'static str {
        match self {
            Self::Production => "https://api.ebay.com",
            Self::Sandbox => "https://api.sandbox.ebay.com",
        }
    }

    /// Default user consent endpoint
    #[must_use]
    pub fn authorize_url(self) -> &'static str {
        match self {
            Self::Production => "https://auth.ebay.com/oauth2/authorize",
            Self::Sandbox => "https://auth.sandbox.ebay.com/oauth2/authorize",
        }
    }
}

/// Remote platform configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Production or sandbox
    pub environment: PlatformEnvironment,
    /// Override for the API base URL
    pub base_url: Option<String>,
    /// Override for the consent URL
    pub authorize_url: Option<String>,
    /// Application client ID (supports `env:VAR_NAME`)
    pub client_id: String,
    /// Application client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Redirect URI registered for the application (the platform calls it a RuName)
    pub redirect_uri: Option<String>,
}

impl PlatformConfig {
    /// Effective API base URL, without trailing slash
    #[must_use]
    pub fn api_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(self.environment.api_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Effective consent URL
    #[must_use]
    pub fn authorize_url(&self) -> String {
        self.authorize_url
            .clone()
            .unwrap_or_else(|| self.environment.authorize_url().to_string())
    }
}

/// Outbound OAuth configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Scopes requested for user tokens
    pub scopes: Vec<String>,
    /// Scopes requested for the application token
    pub app_scopes: Vec<String>,
    /// A cached token is only used while it has more than this left
    #[serde(with = "humantime_serde")]
    pub expiry_buffer: Duration,
    /// Use the application token once the user token can no longer be refreshed
    pub allow_app_fallback: bool,
    /// Seed user access token (supports `env:VAR_NAME`)
    pub access_token: Option<String>,
    /// Seed user refresh token (supports `env:VAR_NAME`)
    pub refresh_token: Option<String>,
    /// Timeout for token endpoint calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_app_scopes() -> Vec<String> {
    vec!["https://api.ebay.com/oauth/api_scope".to_string()]
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            scopes: default_app_scopes(),
            app_scopes: default_app_scopes(),
            expiry_buffer: Duration::from_secs(60),
            allow_app_fallback: false,
            access_token: None,
            refresh_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Outbound API gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Per-attempt request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Local sliding-window throttle
    pub rate_limit: RateLimitConfig,
    /// Retry policy for transient failures
    pub retry: RetryConfig,
    /// Headers added to every outbound call (e.g. `X-EBAY-C-MARKETPLACE-ID`)
    pub default_headers: HashMap<String, String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            default_headers: HashMap::new(),
        }
    }
}

/// Sliding-window rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable the local window
    pub enabled: bool,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Maximum calls inside one window
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 300,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff duration
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
    /// Add random jitter to each delay
    pub jitter: bool,
    /// Retry POST even without an idempotency key
    pub retry_post: bool,
    /// Header whose presence makes a POST safe to retry
    pub idempotency_header: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retry_post: false,
            idempotency_header: "Idempotency-Key".to_string(),
        }
    }
}

/// How inbound tokens are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierMode {
    /// RFC 7662 token introspection
    #[default]
    Introspection,
    /// Local JWT validation against the issuer's JWKS
    Jwt,
}

/// Inbound authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require bearer tokens on `/mcp` (default: false)
    pub enabled: bool,
    /// Verification strategy
    pub mode: VerifierMode,
    /// Authorization server metadata discovery URL
    pub metadata_url: Option<String>,
    /// Inline authorization server metadata (takes precedence over `metadata_url`)
    pub metadata: Option<AuthorizationServerMetadata>,
    /// Expected audience (trailing slash insensitive)
    pub audience: Option<String>,
    /// Scopes every token must carry
    pub required_scopes: Vec<String>,
    /// Client ID for the introspection endpoint (supports `env:VAR_NAME`)
    pub client_id: Option<String>,
    /// Client secret for the introspection endpoint (supports `env:VAR_NAME`)
    pub client_secret: Option<String>,
    /// Realm advertised in `WWW-Authenticate`
    pub realm: String,
    /// Accepted JWT signing algorithms
    pub algorithms: Vec<String>,
    /// How long a fetched JWKS stays fresh
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Refuse plain-HTTP metadata, introspection and JWKS URLs
    pub require_https: bool,
    /// Timeout for calls to the authorization server
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Paths that bypass authentication
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string(), "/.well-known/".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: VerifierMode::default(),
            metadata_url: None,
            metadata: None,
            audience: None,
            required_scopes: Vec::new(),
            client_id: None,
            client_secret: None,
            realm: "marketplace-mcp".to_string(),
            algorithms: vec!["RS256".to_string(), "ES256".to_string()],
            jwks_cache_ttl: Duration::from_secs(3600),
            require_https: true,
            timeout: Duration::from_secs(10),
            public_paths: default_public_paths(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before `env:` references are resolved
        config.load_env_files();
        config.resolve_secrets();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Replace `env:VAR` references in credential fields
    fn resolve_secrets(&mut self) {
        self.platform.client_id = resolve_env_ref(&self.platform.client_id);
        self.platform.client_secret = resolve_env_ref(&self.platform.client_secret);
        for field in [
            &mut self.oauth.access_token,
            &mut self.oauth.refresh_token,
            &mut self.auth.client_id,
            &mut self.auth.client_secret,
        ] {
            if let Some(value) = field.as_mut() {
                *value = resolve_env_ref(value);
            }
        }
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.api.rate_limit.enabled && self.api.rate_limit.max_requests == 0 {
            return Err(Error::Config(
                "api.rate_limit.max_requests must be greater than zero".to_string(),
            ));
        }
        if self.api.retry.multiplier < 1.0 {
            return Err(Error::Config(
                "api.retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.auth.enabled && self.auth.metadata.is_none() && self.auth.metadata_url.is_none() {
            return Err(Error::Config(
                "auth.enabled requires auth.metadata or auth.metadata_url".to_string(),
            ));
        }
        if self.auth.enabled && self.auth.mode == VerifierMode::Jwt && self.auth.algorithms.is_empty()
        {
            return Err(Error::Config(
                "auth.algorithms must list at least one algorithm in jwt mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Resolve `env:VAR_NAME` to the variable's value; other values pass through
fn resolve_env_ref(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).unwrap_or_else(|_| {
            tracing::warn!(var = var_name, "Referenced environment variable is not set");
            String::new()
        }),
        None => value.to_string(),
    }
}

/// Human-readable duration serialization ("30s", "5m", "250ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string (e.g. "30s", "5m", "100ms")
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" first: "100ms" also ends with 's'
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
