// Module: http
// Device WebSocket endpoint and the JSON control API

pub mod control;
pub mod devices;
pub mod error;
pub mod health;
pub mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use driftsee_cluster::Gateway;
use driftsee_core::Config;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{control_status, AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub config: Arc<Config>,
    pub node_id: Arc<str>,
}

impl AppState {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, config: Arc<Config>, node_id: impl Into<Arc<str>>) -> Self {
        Self {
            gateway,
            config,
            node_id: node_id.into(),
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        // Device sockets
        .route(
            "/api/ws/v1/manyRoom/{room_id}/{device_sn}/device/{device_id}",
            get(websocket::device_socket_handler),
        )
        .route(
            "/api/ws/v1/manyRoom/{room_id}/{device_sn}/device/{device_id}/{language}",
            get(websocket::device_socket_handler),
        )
        // Control API
        .route("/api/control/{device_id}", post(control::submit_control))
        .route("/api/devices", get(devices::list_devices))
        .merge(health::create_health_router());

    // Apply layers before state
    let router = router
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}
