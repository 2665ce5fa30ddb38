// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use driftsee_cluster::ControlError;
use driftsee_core::models::CODE_FAILURE;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure, shaped like a failure envelope
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    code: i32,
    error_msg: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            code: CODE_FAILURE,
            error_msg: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// HTTP status for a control command that did not complete
#[must_use]
pub const fn control_status(err: &ControlError) -> StatusCode {
    match err {
        ControlError::Offline(_) => StatusCode::NOT_FOUND,
        ControlError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
        ControlError::DuplicateCorrelation(_) => StatusCode::CONFLICT,
        ControlError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ControlError::ConnectionLost(_) | ControlError::Transport(_) | ControlError::Remote(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}
