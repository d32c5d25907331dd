//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Marketplace MCP server - resilient, OAuth-aware access to the marketplace REST API
#[derive(Parser, Debug)]
#[command(name = "marketplace-mcp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MARKETPLACE_MCP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MARKETPLACE_MCP_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MARKETPLACE_MCP_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MARKETPLACE_MCP_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MARKETPLACE_MCP_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the MCP server (default)
    Serve,

    /// Print the user consent URL for the authorization-code flow
    AuthUrl {
        /// Opaque state echoed back on the redirect (random if omitted)
        #[arg(long)]
        state: Option<String>,
    },

    /// Exchange an authorization code and print the resulting tokens' state
    ExchangeCode {
        /// Authorization code from the consent redirect
        code: String,
    },
}
