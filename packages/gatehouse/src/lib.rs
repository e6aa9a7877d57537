//! Gatehouse: the control plane of a browser terminal gateway.
//!
//! Authenticates WebSocket connections, binds them to long-lived sessions,
//! reclaims idle sessions, and fans notices out to connected users.
//! Extensions are compiled in through [`hooks::Hooks`].

use std::sync::Arc;

use axum::{Router, routing::get};

pub mod authenticator;
pub mod config;
pub mod connections;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod hooks;
pub mod log_cleaner;
pub mod metrics;
pub mod sessions;
pub mod user_store;
pub mod watcher;
pub mod ws;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use gateway::GatewayCore;

/// All HTTP routes, with the core as shared state.
pub fn router(core: Arc<GatewayCore>) -> Router {
    Router::new()
        .route("/ws", get(handlers::websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(core)
}
