//! Server assembly and lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::auth::AuthState;
use super::router::{AppState, create_router};
use crate::api::ApiGateway;
use crate::config::Config;
use crate::oauth::{OAuthSettings, OAuthTokenManager, ProtectedResourceMetadata};
use crate::tools::ToolRegistry;
use crate::verifier::{BearerTokenVerifier, VerifierSettings};
use crate::{Error, Result};

/// Marketplace MCP server
pub struct Server {
    config: Config,
    state: Arc<AppState>,
}

impl Server {
    /// Build every component from configuration
    ///
    /// Initializes the bearer token verifier when inbound auth is enabled.
    pub async fn new(config: Config) -> Result<Self> {
        let tokens = build_token_manager(&config)?;
        let api = Arc::new(ApiGateway::new(
            &config.platform.api_base_url(),
            &config.api,
            tokens.clone(),
        )?);

        let verifier = if config.auth.enabled {
            let verifier = BearerTokenVerifier::new(VerifierSettings::from_config(&config.auth)?)?;
            verifier.initialize().await?;
            Some(Arc::new(verifier))
        } else {
            None
        };

        let resource_url = config.server.resource_url();
        let authorization_server = verifier
            .as_ref()
            .and_then(|v| v.metadata())
            .map(|m| m.issuer.clone());
        let resource_metadata = ProtectedResourceMetadata::new(
            resource_url.clone(),
            authorization_server,
            config.auth.required_scopes.clone(),
        );

        let auth = Arc::new(AuthState {
            verifier,
            realm: config.auth.realm.clone(),
            resource_metadata_url: ProtectedResourceMetadata::document_url(&resource_url),
            public_paths: config.auth.public_paths.clone(),
        });

        let state = Arc::new(AppState {
            tools: ToolRegistry::new(tokens.clone(), api),
            tokens,
            resource_metadata,
            auth,
            max_body_size: config.server.max_body_size,
        });

        Ok(Self { config, state })
    }

    /// Router over the assembled state
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Bind and serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let listener = TcpListener::bind(addr).await?;
        info!(
            host = %self.config.server.host,
            port = self.config.server.port,
            environment = ?self.config.platform.environment,
            inbound_auth = self.config.auth.enabled,
            "Listening"
        );
        if !self.state.tokens.is_authenticated() {
            warn!("No user token installed; calls use the application token until a user authorizes");
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}

/// Token manager with user tokens seeded from configuration
///
/// With only a refresh token, the access token is installed already expired
/// so the first call refreshes it.
pub fn build_token_manager(config: &Config) -> Result<Arc<OAuthTokenManager>> {
    let manager = OAuthTokenManager::new(OAuthSettings::from_config(&config.platform, &config.oauth))?;

    let access = config.oauth.access_token.clone().filter(|t| !t.is_empty());
    let refresh = config.oauth.refresh_token.clone().filter(|t| !t.is_empty());
    match (access, refresh) {
        (Some(access), refresh) => {
            manager.set_user_tokens(access, refresh, None, None);
        }
        (None, Some(refresh)) => {
            manager.set_user_tokens(String::new(), Some(refresh), Some(0), None);
        }
        (None, None) => {}
    }

    Ok(Arc::new(manager))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
