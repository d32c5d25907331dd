//! MCP Protocol types

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Latest MCP protocol version
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this server can speak, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Echo the client's version when supported, otherwise offer the latest
#[must_use]
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    requested
        .and_then(|v| SUPPORTED_VERSIONS.iter().copied().find(|s| *s == v))
        .unwrap_or(PROTOCOL_VERSION)
}
