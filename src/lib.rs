//! Marketplace MCP Server Library
//!
//! Exposes a marketplace REST API to MCP clients through one resilient
//! gateway.
//!
//! # Features
//!
//! - **Outbound OAuth**: user token with single-flight refresh, application
//!   token fallback, authorization-code exchange
//! - **Resilient gateway**: sliding-window self throttle, jittered retries on
//!   transient failures, normalized upstream errors
//! - **Inbound auth**: RFC 7662 introspection or local JWT validation,
//!   RFC 6750 challenges, RFC 9728 protected resource metadata

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod oauth;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod verifier;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Logs go to stderr so stdout stays clean for CLI output.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    result.map_err(|e| Error::Internal(format!("Failed to initialize tracing: {e}")))
}
