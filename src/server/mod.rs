//! Server wiring: configuration, shared application state and startup.

/// Environment-driven configuration
pub mod config;

/// Shared application state and axum extraction
pub mod state;

/// Startup wiring: pools, stores, workers, routers
pub mod init;

pub use config::Config;
pub use state::AppState;
