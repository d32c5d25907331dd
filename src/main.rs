//! Marketplace MCP server

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use uuid::Uuid;

use marketplace_mcp::{
    cli::{Cli, Command},
    config::Config,
    server::{Server, build_token_manager},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::AuthUrl { state }) => run_auth_url(&config, state),
        Some(Command::ExchangeCode { code }) => run_exchange_code(&config, &code).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Print the consent URL
fn run_auth_url(config: &Config, state: Option<String>) -> ExitCode {
    let manager = match build_token_manager(config) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to create token manager: {e}");
            return ExitCode::FAILURE;
        }
    };

    let state = state.unwrap_or_else(|| Uuid::new_v4().to_string());
    match manager.authorization_url(Some(&state)) {
        Ok(url) => {
            println!("Open this URL and approve access:\n\n{url}\n");
            println!("state: {state}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Exchange a code and print what to put into configuration
async fn run_exchange_code(config: &Config, code: &str) -> ExitCode {
    let manager = match build_token_manager(config) {
        Ok(m) => m,
        Err(e) => {
            error!("Failed to create token manager: {e}");
            return ExitCode::FAILURE;
        }
    };

    let info = match manager.exchange_code_for_token(code.trim()).await {
        Ok(info) => info,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&info) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!("Failed to render token info: {e}");
            return ExitCode::FAILURE;
        }
    }
    if let Some(refresh) = manager.store().user().and_then(|r| r.refresh_token) {
        println!("\nSet this refresh token as oauth.refresh_token (e.g. MARKETPLACE_MCP_OAUTH__REFRESH_TOKEN):\n\n{refresh}");
    }
    ExitCode::SUCCESS
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        base_url = %config.platform.api_base_url(),
        "Starting marketplace MCP server"
    );

    let server = match Server::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}
