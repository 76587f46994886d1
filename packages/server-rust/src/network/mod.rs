//! axum HTTP surface over the orchestrator.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;

pub use config::NetworkConfig;
pub use handlers::{ApiError, AppState};
pub use module::{build_router, NetworkModule};
