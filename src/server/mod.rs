//! HTTP server: MCP endpoint, inbound bearer auth, RFC 9728 metadata

mod auth;
mod router;
#[allow(clippy::module_inception)]
mod server;

pub use auth::{AuthState, auth_middleware};
pub use router::{AppState, create_router};
pub use server::{Server, build_token_manager};
