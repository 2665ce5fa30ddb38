//! Device listing

use axum::{
    extract::{Query, State},
    Json,
};
use driftsee_core::models::{RoomId, CODE_SUCCESS};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http::AppState;

#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    pub room_id: Option<String>,
}

/// Devices connected to this node, optionally filtered by room
pub async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Json<Value> {
    let room = query.room_id.map(RoomId::from);
    let devices = state.gateway.list_devices(room.as_ref());

    Json(json!({
        "code": CODE_SUCCESS,
        "count": devices.len(),
        "data": devices,
    }))
}
