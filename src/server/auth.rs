//! Bearer token middleware
//!
//! Rejections follow RFC 6750: 401 with a `WWW-Authenticate` challenge that
//! points at the protected resource metadata (RFC 9728), or 403 when the
//! token lacks required scopes. Descriptions are generic; the precise reason
//! is only logged.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::Error;
use crate::verifier::BearerTokenVerifier;

/// Generic description for rejected tokens
const INVALID_TOKEN_DESCRIPTION: &str = "The access token is missing, invalid or expired";

/// Middleware state
pub struct AuthState {
    /// Verifier; `None` disables authentication
    pub verifier: Option<Arc<BearerTokenVerifier>>,
    /// Realm advertised in challenges
    pub realm: String,
    /// URL of this server's protected resource metadata
    pub resource_metadata_url: String,
    /// Paths that bypass authentication (prefix match)
    pub public_paths: Vec<String>,
}

impl AuthState {
    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn challenge(&self, error: Option<(&str, &str)>, scope: Option<&str>) -> String {
        let mut value = format!(
            "Bearer realm=\"{}\", resource_metadata=\"{}\"",
            quote(&self.realm),
            quote(&self.resource_metadata_url)
        );
        if let Some((code, description)) = error {
            value.push_str(&format!(
                ", error=\"{code}\", error_description=\"{}\"",
                quote(description)
            ));
        }
        if let Some(scope) = scope {
            value.push_str(&format!(", scope=\"{}\"", quote(scope)));
        }
        value
    }

    fn unauthorized(&self, with_error: bool) -> Response {
        let challenge = self.challenge(
            with_error.then_some(("invalid_token", INVALID_TOKEN_DESCRIPTION)),
            None,
        );
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, challenge)],
            Json(json!({
                "error": "invalid_token",
                "error_description": INVALID_TOKEN_DESCRIPTION
            })),
        )
            .into_response()
    }

    fn forbidden(&self, required: &[String], provided: &[String]) -> Response {
        let required_joined = required.join(" ");
        let challenge = self.challenge(
            Some((
                "insufficient_scope",
                "The access token does not carry the required scopes",
            )),
            Some(&required_joined),
        );
        (
            StatusCode::FORBIDDEN,
            [(header::WWW_AUTHENTICATE, challenge)],
            Json(json!({
                "error": "insufficient_scope",
                "required_scopes": required,
                "provided_scopes": provided
            })),
        )
            .into_response()
    }
}

/// Authenticate requests to non-public paths
pub async fn auth_middleware(
    State(auth): State<Arc<AuthState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(verifier) = auth.verifier.as_ref() else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    if auth.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let Some(token) = bearer_token(&request) else {
        debug!(path = %path, "Missing bearer token");
        return auth.unauthorized(false);
    };

    match verifier.verify_token(&token).await {
        Ok(verified) => {
            debug!(client_id = %verified.client_id, path = %path, "Authenticated request");
            request.extensions_mut().insert(verified);
            next.run(request).await
        }
        Err(Error::InvalidToken(reason)) => {
            warn!(path = %path, reason = %reason, "Rejected bearer token");
            auth.unauthorized(true)
        }
        Err(Error::InsufficientScope {
            required,
            provided,
            missing,
        }) => {
            warn!(path = %path, missing = ?missing, "Bearer token lacks required scopes");
            auth.forbidden(&required, &provided)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Token verification failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "server_error",
                    "error_description": "Token verification is temporarily unavailable"
                })),
            )
                .into_response()
        }
    }
}

/// Token from `Authorization: Bearer <token>` (scheme is case-insensitive)
fn bearer_token(request: &Request<Body>) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Escape a value for a quoted-string
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
