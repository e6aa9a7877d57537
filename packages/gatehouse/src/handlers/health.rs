use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};

use crate::gateway::GatewayCore;

/// Health check endpoint - returns server status
pub async fn health_handler(State(core): State<Arc<GatewayCore>>) -> impl IntoResponse {
    Json(core.health())
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(core): State<Arc<GatewayCore>>) -> impl IntoResponse {
    Json(core.metrics().snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
