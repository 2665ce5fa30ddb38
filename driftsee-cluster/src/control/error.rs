use driftsee_core::models::{DeviceId, Envelope, PlayId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal failure of a control command
///
/// A device that answers with `code: -1` is not an error here: its
/// acknowledgement is returned as a successful result and the caller reads
/// the code.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ControlError {
    #[error("device {0} is offline")]
    Offline(DeviceId),

    #[error("device {0} is busy")]
    Busy(DeviceId),

    #[error("device did not respond within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection to device {0} was lost")]
    ConnectionLost(DeviceId),

    #[error("playId {0} is already pending for this device")]
    DuplicateCorrelation(PlayId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote node error: {0}")]
    Remote(String),
}

impl ControlError {
    /// Short machine-readable name, used in logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offline(_) => "offline",
            Self::Busy(_) => "busy",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionLost(_) => "connection_lost",
            Self::DuplicateCorrelation(_) => "duplicate_correlation",
            Self::Transport(_) => "transport",
            Self::Remote(_) => "remote",
        }
    }

    /// Failure envelope answering `request`
    #[must_use]
    pub fn to_envelope(&self, request: &Envelope) -> Envelope {
        Envelope::failure(
            request.kind,
            request.event.clone(),
            request.device_id.clone(),
            request.play_id.clone(),
            self.to_string(),
        )
    }
}

pub type ControlResult = std::result::Result<Envelope, ControlError>;
