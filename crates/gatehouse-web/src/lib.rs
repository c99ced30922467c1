//! REST surface for Gatehouse.
//!
//! This crate exposes the routing and approval pipeline over HTTP:
//!
//! - Request submission, lookup and cancellation.
//! - Pending approval listing and decisions.
//! - Dry-run routing, statistics and health.
//! - Hot reload of rule and route files from the config directory.

pub mod api;
pub mod error;
pub mod reload;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use reload::ConfigReloader;
pub use server::WebServer;
pub use state::AppState;

/// Web server configuration.
#[derive(Debug, Clone)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8080,
        }
    }
}
