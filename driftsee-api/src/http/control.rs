//! Control API
//!
//! `POST /api/control/{device_id}` holds the request open until the device
//! acknowledges the command or the command fails.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use driftsee_core::models::{DeviceId, Envelope, MessageType, PlayId};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::http::{control_status, AppError, AppResult, AppState};

/// Control request body
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub event: String,
    #[serde(rename = "playId")]
    pub play_id: Option<PlayId>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
pub struct ControlQuery {
    /// Per-request timeout override in milliseconds, capped by configuration
    pub timeout_ms: Option<u64>,
}

pub async fn submit_control(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<ControlQuery>,
    body: Result<Json<ControlRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(req) = body.map_err(|e| AppError::bad_request(format!("Invalid request body: {e}")))?;
    if req.event.trim().is_empty() {
        return Err(AppError::bad_request("event is required"));
    }

    let device_id = DeviceId::from(device_id);
    let play_id = req.play_id.unwrap_or_default();
    let request = Envelope::new(MessageType::Control, req.event)
        .with_device(device_id.clone())
        .with_play_id(play_id.clone())
        .with_data(req.data);

    info!(device_id = %device_id, play_id = %play_id, event = %request.event, "Control request");

    let result = state
        .gateway
        .submit_control(&device_id, request.clone(), query.timeout_ms.map(Duration::from_millis))
        .await;

    Ok(match result {
        Ok(ack) if ack.is_success() => (StatusCode::OK, Json(ack)).into_response(),
        // The device answered, but reported failure
        Ok(ack) => (StatusCode::BAD_REQUEST, Json(ack)).into_response(),
        Err(e) => {
            warn!(device_id = %device_id, play_id = %play_id, error = %e, "Control request failed");
            (control_status(&e), Json(e.to_envelope(&request))).into_response()
        }
    })
}
