//! OAuth token manager
//!
//! Keeps a delegated user token and a fallback application token valid for
//! the lifetime of the process. Grants for each track are serialized by an
//! async mutex: callers that queue behind an in-flight grant share its
//! outcome. On success they re-read the store and reuse the new token; on
//! failure they get the same error without calling the token endpoint again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use super::TokenSource;
use super::basic_credentials;
use super::store::{AppTokenRecord, TokenRecord, TokenStore, expiry_after, now_ms};
use crate::config::{OAuthConfig, PlatformConfig};
use crate::{Error, Result};

/// Token endpoint path relative to the API base URL
pub const TOKEN_PATH: &str = "/identity/v1/oauth2/token";

/// Default user access token lifetime when none is supplied
pub const DEFAULT_ACCESS_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Default user refresh token lifetime (18 months) when none is supplied
pub const DEFAULT_REFRESH_LIFETIME: Duration = Duration::from_secs(47_304_000);

const GRANT_REFRESH: &str = "refresh_token";
const GRANT_CODE: &str = "authorization_code";
const GRANT_CLIENT: &str = "client_credentials";

/// Resolved token manager settings
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    /// Token endpoint URL
    pub token_url: String,
    /// User consent URL
    pub authorize_url: String,
    /// Application client ID
    pub client_id: String,
    /// Application client secret
    pub client_secret: String,
    /// Registered redirect URI (RuName)
    pub redirect_uri: Option<String>,
    /// Scopes for user grants
    pub scopes: Vec<String>,
    /// Scopes for the client-credentials grant
    pub app_scopes: Vec<String>,
    /// Minimum remaining lifetime for a cached token
    pub expiry_buffer: Duration,
    /// Fall back to the application token when the user token is exhausted
    pub allow_app_fallback: bool,
    /// Timeout for token endpoint calls
    pub timeout: Duration,
}

impl OAuthSettings {
    /// Resolve settings from configuration sections
    #[must_use]
    pub fn from_config(platform: &PlatformConfig, oauth: &OAuthConfig) -> Self {
        Self {
            token_url: format!("{}{TOKEN_PATH}", platform.api_base_url()),
            authorize_url: platform.authorize_url(),
            client_id: platform.client_id.clone(),
            client_secret: platform.client_secret.clone(),
            redirect_uri: platform.redirect_uri.clone(),
            scopes: oauth.scopes.clone(),
            app_scopes: oauth.app_scopes.clone(),
            expiry_buffer: oauth.expiry_buffer,
            allow_app_fallback: oauth.allow_app_fallback,
            timeout: oauth.timeout,
        }
    }
}

/// Token endpoint success response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    refresh_token_expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Token endpoint error response (RFC 6749 §5.2)
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Read-only token diagnostics (never contains token values)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenInfo {
    /// A user record is installed
    pub has_user_token: bool,
    /// The user access token is usable without a refresh
    pub user_token_valid: bool,
    /// User access token expiry (epoch ms)
    pub user_token_expires_at: Option<u64>,
    /// The user token can still be refreshed
    pub can_refresh: bool,
    /// Refresh token expiry (epoch ms)
    pub refresh_token_expires_at: Option<u64>,
    /// Scopes granted to the user token
    pub scopes: Vec<String>,
    /// An application token is cached
    pub has_app_token: bool,
    /// Application token expiry (epoch ms)
    pub app_token_expires_at: Option<u64>,
}

/// A grant that failed, kept so queued callers can share the outcome
#[derive(Debug)]
struct GrantFailure {
    generation: u64,
    grant: &'static str,
    message: String,
}

impl GrantFailure {
    fn to_error(&self) -> Error {
        Error::TokenGrant {
            grant: self.grant,
            message: self.message.clone(),
        }
    }
}

/// Single-flight slot for one token track
#[derive(Debug, Default)]
struct GrantFlight {
    /// Grants finished on this track
    completed: AtomicU64,
    last_failure: Mutex<Option<GrantFailure>>,
}

impl GrantFlight {
    /// Wait for the track; also returns how many grants had finished on arrival
    async fn enter(&self) -> (MutexGuard<'_, Option<GrantFailure>>, u64) {
        let seen = self.completed.load(Ordering::Acquire);
        (self.last_failure.lock().await, seen)
    }

    /// Failure of a grant that finished while the caller was queued
    fn shared_failure(slot: Option<&GrantFailure>, seen: u64) -> Option<Error> {
        slot.filter(|failure| failure.generation > seen)
            .map(GrantFailure::to_error)
    }

    /// Record a finished grant; must be called with the slot locked
    fn finish<T>(
        &self,
        slot: &mut Option<GrantFailure>,
        grant: &'static str,
        result: &Result<T>,
    ) {
        let generation = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        *slot = result.as_ref().err().map(|e| GrantFailure {
            generation,
            grant,
            message: match e {
                Error::TokenGrant { message, .. } => message.clone(),
                other => other.to_string(),
            },
        });
    }
}

/// Outbound token lifecycle manager
pub struct OAuthTokenManager {
    http: Client,
    settings: OAuthSettings,
    store: TokenStore,
    user_flight: GrantFlight,
    app_flight: GrantFlight,
}

impl OAuthTokenManager {
    /// Create a manager with its own HTTP client
    pub fn new(settings: OAuthSettings) -> Result<Self> {
        let http = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self::with_client(http, settings))
    }

    /// Create a manager using an existing HTTP client
    #[must_use]
    pub fn with_client(http: Client, settings: OAuthSettings) -> Self {
        Self {
            http,
            settings,
            store: TokenStore::new(),
            user_flight: GrantFlight::default(),
            app_flight: GrantFlight::default(),
        }
    }

    /// Underlying token store
    #[must_use]
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// Resolved settings
    #[must_use]
    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }

    /// Get a currently valid outbound token, preferring the user token
    pub async fn get_access_token(&self) -> Result<String> {
        let now = now_ms();
        let buffer = self.settings.expiry_buffer;

        if let Some(record) = self.store.user() {
            if record.access_valid(now, buffer) {
                debug!("Using cached user access token");
                return Ok(record.access_token);
            }
            if record.refresh_valid(now) {
                return self.refresh_user_token().await;
            }
            if !self.settings.allow_app_fallback {
                return Err(Error::AuthExpired(
                    "user access and refresh tokens have both expired".to_string(),
                ));
            }
            warn!("User token exhausted, discarding it and falling back to the application token");
            self.store.clear_user();
        }

        self.app_access_token().await
    }

    /// Refresh the user token under the single-flight lock
    async fn refresh_user_token(&self) -> Result<String> {
        let (mut slot, seen) = self.user_flight.enter().await;

        // Another caller may have refreshed while we waited
        let now = now_ms();
        let record = self.store.user().ok_or_else(|| {
            Error::AuthExpired("user token was cleared during refresh".to_string())
        })?;
        if record.access_valid(now, self.settings.expiry_buffer) {
            debug!("User token refreshed by a concurrent caller");
            return Ok(record.access_token);
        }
        if let Some(err) = GrantFlight::shared_failure(slot.as_ref(), seen) {
            debug!("Concurrent user token refresh failed, sharing its error");
            return Err(err);
        }
        let refresh_token = match record.refresh_token {
            Some(token) if record.refresh_expiry > now => token,
            _ => {
                return Err(Error::AuthExpired(
                    "refresh token is missing or expired".to_string(),
                ));
            }
        };

        let scope = self.settings.scopes.join(" ");
        let mut form = vec![
            ("grant_type", GRANT_REFRESH),
            ("refresh_token", refresh_token.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let result = self.request_token(GRANT_REFRESH, &form).await;
        self.user_flight.finish(&mut slot, GRANT_REFRESH, &result);
        let response = result?;
        let now = now_ms();
        let updated = self
            .store
            .update_user(|record| apply_refresh(record, response, now))
            .ok_or_else(|| {
                Error::AuthExpired("user token was cleared during refresh".to_string())
            })?;

        info!(
            expires_at = updated.access_expiry,
            "User access token refreshed"
        );
        Ok(updated.access_token)
    }

    /// Cached application token, or a fresh client-credentials grant
    async fn app_access_token(&self) -> Result<String> {
        let buffer = self.settings.expiry_buffer;
        if let Some(app) = self.store.app() {
            if app.valid(now_ms(), buffer) {
                return Ok(app.access_token);
            }
        }

        let (mut slot, seen) = self.app_flight.enter().await;
        if let Some(app) = self.store.app() {
            if app.valid(now_ms(), buffer) {
                return Ok(app.access_token);
            }
        }
        if let Some(err) = GrantFlight::shared_failure(slot.as_ref(), seen) {
            debug!("Concurrent client-credentials grant failed, sharing its error");
            return Err(err);
        }

        let scope = self.settings.app_scopes.join(" ");
        let mut form = vec![("grant_type", GRANT_CLIENT)];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let result = self.request_token(GRANT_CLIENT, &form).await;
        self.app_flight.finish(&mut slot, GRANT_CLIENT, &result);
        let response = result?;
        let record = AppTokenRecord {
            expiry: lifetime_expiry(now_ms(), response.expires_in, DEFAULT_ACCESS_LIFETIME),
            access_token: response.access_token,
        };
        info!(expires_at = record.expiry, "Application access token acquired");
        self.store.set_app(record.clone());
        Ok(record.access_token)
    }

    /// Install externally supplied user tokens
    ///
    /// Missing expiries default to two hours (access) and 18 months (refresh).
    pub fn set_user_tokens(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        access_expiry: Option<u64>,
        refresh_expiry: Option<u64>,
    ) {
        let now = now_ms();
        let record = TokenRecord {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            access_expiry: access_expiry.unwrap_or_else(|| expiry_after(now, DEFAULT_ACCESS_LIFETIME)),
            refresh_expiry: refresh_expiry
                .unwrap_or_else(|| expiry_after(now, DEFAULT_REFRESH_LIFETIME)),
            scopes: self.settings.scopes.clone(),
        };
        info!(
            access_expires_at = record.access_expiry,
            refresh_expires_at = record.refresh_expiry,
            "User tokens installed"
        );
        self.store.set_user(record);
    }

    /// Build the user consent URL for the authorization-code flow
    pub fn authorization_url(&self, state: Option<&str>) -> Result<String> {
        let redirect_uri = self.redirect_uri()?;
        let mut url = Url::parse(&self.settings.authorize_url)
            .map_err(|e| Error::Config(format!("Invalid authorize URL: {e}")))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("client_id", &self.settings.client_id);
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("response_type", "code");
            if !self.settings.scopes.is_empty() {
                params.append_pair("scope", &self.settings.scopes.join(" "));
            }
            if let Some(state) = state {
                params.append_pair("state", state);
            }
        }
        Ok(url.to_string())
    }

    /// Exchange an authorization code for a user token
    pub async fn exchange_code_for_token(&self, code: &str) -> Result<TokenInfo> {
        let redirect_uri = self.redirect_uri()?;
        // Serialized with refreshes; its outcome is not shared with them
        let _slot = self.user_flight.enter().await;

        let form = [
            ("grant_type", GRANT_CODE),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        let response = self.request_token(GRANT_CODE, &form).await?;

        let now = now_ms();
        let record = TokenRecord {
            token_type: response
                .token_type
                .unwrap_or_else(|| "Bearer".to_string()),
            access_expiry: lifetime_expiry(now, response.expires_in, DEFAULT_ACCESS_LIFETIME),
            refresh_expiry: lifetime_expiry(
                now,
                response.refresh_token_expires_in,
                DEFAULT_REFRESH_LIFETIME,
            ),
            scopes: response
                .scope
                .map_or_else(|| self.settings.scopes.clone(), |s| split_scopes(&s)),
            refresh_token: response.refresh_token,
            access_token: response.access_token,
        };
        self.store.set_user(record);
        info!("Authorization code exchanged for user tokens");

        Ok(self.token_info())
    }

    /// Discard both token records
    pub fn clear_all_tokens(&self) {
        self.store.clear_all();
        info!("All tokens cleared");
    }

    /// Read-only diagnostics
    #[must_use]
    pub fn token_info(&self) -> TokenInfo {
        let now = now_ms();
        let user = self.store.user();
        let app = self.store.app();
        TokenInfo {
            has_user_token: user.is_some(),
            user_token_valid: user
                .as_ref()
                .is_some_and(|r| r.access_valid(now, self.settings.expiry_buffer)),
            user_token_expires_at: user.as_ref().map(|r| r.access_expiry),
            can_refresh: user.as_ref().is_some_and(|r| r.refresh_valid(now)),
            refresh_token_expires_at: user
                .as_ref()
                .filter(|r| r.refresh_token.is_some())
                .map(|r| r.refresh_expiry),
            scopes: user.map(|r| r.scopes).unwrap_or_default(),
            has_app_token: app.is_some(),
            app_token_expires_at: app.map(|a| a.expiry),
        }
    }

    /// Whether a user token is usable now or after a refresh
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        let now = now_ms();
        self.store.user().is_some_and(|r| {
            r.access_valid(now, self.settings.expiry_buffer) || r.refresh_valid(now)
        })
    }

    fn redirect_uri(&self) -> Result<&str> {
        self.settings
            .redirect_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| {
                Error::Config("platform.redirect_uri is required for user authorization".to_string())
            })
    }

    /// POST a grant to the token endpoint
    async fn request_token(&self, grant: &'static str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        debug!(grant, "Requesting token");

        let response = self
            .http
            .post(&self.settings.token_url)
            .header(
                AUTHORIZATION,
                basic_credentials(&self.settings.client_id, &self.settings.client_secret),
            )
            .form(form)
            .send()
            .await
            .map_err(|e| Error::TokenGrant {
                grant,
                message: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenErrorResponse>(&body).map_or_else(
                |_| status.canonical_reason().unwrap_or("unknown error").to_string(),
                |e| match e.error_description {
                    Some(description) => format!("{}: {description}", e.error),
                    None => e.error,
                },
            );
            warn!(grant, status = status.as_u16(), "Token endpoint rejected grant");
            return Err(Error::TokenGrant {
                grant,
                message: format!("HTTP {}: {reason}", status.as_u16()),
            });
        }

        response.json().await.map_err(|e| Error::TokenGrant {
            grant,
            message: format!("invalid token response: {e}"),
        })
    }
}

#[async_trait]
impl TokenSource for OAuthTokenManager {
    async fn access_token(&self) -> Result<String> {
        self.get_access_token().await
    }
}

/// Apply a refresh response to the stored record
fn apply_refresh(record: &mut TokenRecord, response: TokenResponse, now: u64) {
    record.access_token = response.access_token;
    record.access_expiry = lifetime_expiry(now, response.expires_in, DEFAULT_ACCESS_LIFETIME);
    if let Some(token_type) = response.token_type {
        record.token_type = token_type;
    }
    if let Some(rotated) = response.refresh_token {
        record.refresh_token = Some(rotated);
        if let Some(secs) = response.refresh_token_expires_in {
            record.refresh_expiry = expiry_after(now, Duration::from_secs(secs));
        }
    }
    if let Some(scope) = response.scope {
        record.scopes = split_scopes(&scope);
    }
}

fn lifetime_expiry(now: u64, seconds: Option<u64>, default: Duration) -> u64 {
    expiry_after(now, seconds.map_or(default, Duration::from_secs))
}

fn split_scopes(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(String::from).collect()
}
