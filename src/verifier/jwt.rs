//! Local JWT validation against the authorization server's JWKS
//!
//! 1. Decode the header (unverified) for `kid` and `alg`.
//! 2. Reject algorithms outside the allow-list.
//! 3. Find the key in the cached JWKS; an unknown `kid` forces one refresh.
//! 4. Verify signature, expiry (60 s leeway) and issuer.
//! 5. Extract audience and the `scope`/`scp` claim.

use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::{VerifiedToken, scope_claim, string_or_list};
use crate::oauth::AuthorizationServerMetadata;
use crate::{Error, Result};

/// Clock skew tolerance for `exp`/`nbf`
const LEEWAY_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    azp: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    aud: Option<Value>,
    #[serde(default)]
    scope: Option<Value>,
    #[serde(default)]
    scp: Option<Value>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache for one authorization server
pub struct JwksCache {
    http: Client,
    ttl: Duration,
    cached: RwLock<Option<CachedJwks>>,
}

impl JwksCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(http: Client, ttl: Duration) -> Self {
        Self {
            http,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// Cached key set, or a fresh fetch when stale or `force_refresh` is set
    pub async fn get_or_fetch(&self, jwks_uri: &str, force_refresh: bool) -> Result<JwkSet> {
        if !force_refresh {
            if let Some(cached) = self.cached.read().as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(uri = %jwks_uri, force_refresh, "Fetching JWKS");
        let response = self.http.get(jwks_uri).send().await?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "JWKS fetch failed: HTTP {}",
                response.status().as_u16()
            )));
        }
        let keys: JwkSet = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Invalid JWKS document: {e}")))?;

        *self.cached.write() = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }
}

/// Validates JWT access tokens locally
pub struct JwtVerifier {
    jwks: JwksCache,
    algorithms: Vec<Algorithm>,
}

impl JwtVerifier {
    /// Create a verifier accepting the given algorithms
    #[must_use]
    pub fn new(jwks: JwksCache, algorithms: Vec<Algorithm>) -> Self {
        Self { jwks, algorithms }
    }

    pub(super) async fn verify(
        &self,
        token: &str,
        metadata: &AuthorizationServerMetadata,
    ) -> Result<VerifiedToken> {
        let jwks_uri = metadata.jwks_uri.as_deref().ok_or_else(|| {
            Error::Config("Authorization server metadata has no jwks_uri".to_string())
        })?;

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::InvalidToken(format!("malformed token: {e}")))?;
        if !self.algorithms.contains(&header.alg) {
            return Err(Error::InvalidToken(format!(
                "algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let jwk = self.find_key(jwks_uri, header.kid.as_deref()).await?;
        if let Some(key_alg) = &jwk.common.key_algorithm {
            if format!("{key_alg:?}") != format!("{:?}", header.alg) {
                return Err(Error::InvalidToken(
                    "token algorithm does not match signing key".to_string(),
                ));
            }
        }
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| Error::InvalidToken(format!("unusable signing key: {e}")))?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = LEEWAY_SECS;
        validation.set_issuer(&[metadata.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        // Audience is compared by the caller, trailing-slash tolerant
        validation.validate_aud = false;

        let claims = jsonwebtoken::decode::<AccessTokenClaims>(token, &key, &validation)
            .map_err(|e| Error::InvalidToken(e.to_string()))?
            .claims;

        let scopes = claims
            .scope
            .as_ref()
            .or(claims.scp.as_ref())
            .and_then(scope_claim)
            .ok_or_else(|| Error::InvalidToken("token carries no scope claim".to_string()))?;

        Ok(VerifiedToken {
            token: token.to_string(),
            client_id: claims
                .client_id
                .or(claims.azp)
                .or_else(|| claims.sub.clone())
                .unwrap_or_default(),
            scopes,
            expires_at: claims.exp,
            audience: claims.aud.as_ref().map(string_or_list).unwrap_or_default(),
            subject: claims.sub,
        })
    }

    /// Look up the signing key, refreshing once if the `kid` is unknown
    async fn find_key(&self, jwks_uri: &str, kid: Option<&str>) -> Result<Jwk> {
        let jwks = self.jwks.get_or_fetch(jwks_uri, false).await?;
        if let Some(jwk) = select_key(&jwks, kid) {
            return Ok(jwk);
        }

        let Some(kid) = kid else {
            return Err(Error::InvalidToken(
                "token has no kid and the key set is ambiguous".to_string(),
            ));
        };

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks.get_or_fetch(jwks_uri, true).await?;
        select_key(&jwks, Some(kid))
            .ok_or_else(|| Error::InvalidToken(format!("unknown signing key {kid}")))
    }
}

fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => jwks.find(kid).cloned(),
        None if jwks.keys.len() == 1 => jwks.keys.first().cloned(),
        None => None,
    }
}
