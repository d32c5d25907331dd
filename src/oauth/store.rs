//! In-memory token store
//!
//! Holds the delegated user token and the application token for the
//! lifetime of the process. Locks are held only to copy records in or out.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

/// Convert a relative lifetime into an absolute expiry
#[must_use]
pub fn expiry_after(now: u64, lifetime: Duration) -> u64 {
    now.saturating_add(u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX))
}

/// Delegated user token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Access token
    pub access_token: String,
    /// Refresh token (may rotate on every refresh)
    pub refresh_token: Option<String>,
    /// Token type (usually "Bearer")
    pub token_type: String,
    /// Access token expiry (epoch ms)
    pub access_expiry: u64,
    /// Refresh token expiry (epoch ms)
    pub refresh_expiry: u64,
    /// Granted scopes
    pub scopes: Vec<String>,
}

impl TokenRecord {
    /// Whether the access token outlives `now + buffer`
    #[must_use]
    pub fn access_valid(&self, now: u64, buffer: Duration) -> bool {
        self.access_expiry > expiry_after(now, buffer)
    }

    /// Whether a refresh grant may still be attempted
    #[must_use]
    pub fn refresh_valid(&self, now: u64) -> bool {
        self.refresh_token.is_some() && self.refresh_expiry > now
    }
}

/// Application (client-credentials) token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTokenRecord {
    /// Access token
    pub access_token: String,
    /// Expiry (epoch ms)
    pub expiry: u64,
}

impl AppTokenRecord {
    /// Whether the token outlives `now + buffer`
    #[must_use]
    pub fn valid(&self, now: u64, buffer: Duration) -> bool {
        self.expiry > expiry_after(now, buffer)
    }
}

/// Token store owned by one token manager
#[derive(Debug, Default)]
pub struct TokenStore {
    user: RwLock<Option<TokenRecord>>,
    app: RwLock<Option<AppTokenRecord>>,
}

impl TokenStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current user record
    pub fn user(&self) -> Option<TokenRecord> {
        self.user.read().clone()
    }

    /// Install a user record, replacing any previous one
    pub fn set_user(&self, record: TokenRecord) {
        *self.user.write() = Some(record);
    }

    /// Mutate the user record in place; returns the updated copy
    pub fn update_user(&self, f: impl FnOnce(&mut TokenRecord)) -> Option<TokenRecord> {
        let mut guard = self.user.write();
        let record = guard.as_mut()?;
        f(record);
        Some(record.clone())
    }

    /// Discard the user record
    pub fn clear_user(&self) {
        *self.user.write() = None;
    }

    /// Current application record
    pub fn app(&self) -> Option<AppTokenRecord> {
        self.app.read().clone()
    }

    /// Install an application record
    pub fn set_app(&self, record: AppTokenRecord) {
        *self.app.write() = Some(record);
    }

    /// Discard both records
    pub fn clear_all(&self) {
        *self.user.write() = None;
        *self.app.write() = None;
    }
}
