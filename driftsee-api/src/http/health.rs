//! Health check endpoints
//!
//! Provides simple health check for monitoring probes.

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/api/health", get(health_check))
}

/// Basic health check (always healthy if the server is answering)
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": state.config.server.app_name,
        "version": state.config.server.app_version,
        "node_id": &*state.node_id,
        "connected_devices": state.gateway.connected_devices(),
    }))
}
