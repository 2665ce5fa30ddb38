use serde::{Deserialize, Serialize};

use super::id::{DeviceId, PlayId};

/// Well-known `event` values. The field itself is free-form.
pub mod events {
    pub const JOIN: &str = "join";
    pub const DEVICE_INFO: &str = "device_info";
    pub const START_RTMP: &str = "start_rtmp";
    pub const STOP_RTMP: &str = "stop_rtmp";
    pub const GET_RTMP: &str = "get_rtmp";
}

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_FAILURE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Fire-and-forget notification
    #[default]
    Notify,
    /// Command from the gateway to a device, or its acknowledgement
    Control,
    /// Request raised by a device that expects a gateway reply
    DeviceControl,
    /// Gateway reply to a `device_control` request
    DeviceNotify,
}

/// Wire schema shared by the device socket and the HTTP control endpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub event: String,
    #[serde(rename = "deviceId", default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(rename = "playId", default, skip_serializing_if = "Option::is_none")]
    pub play_id: Option<PlayId>,
    #[serde(default)]
    pub code: i32,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: MessageType, event: impl Into<String>) -> Self {
        Self {
            kind,
            event: event.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn control(event: impl Into<String>) -> Self {
        Self::new(MessageType::Control, event)
    }

    #[must_use]
    pub fn with_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    #[must_use]
    pub fn with_play_id(mut self, play_id: PlayId) -> Self {
        self.play_id = Some(play_id);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Failure reply mirroring the request's routing fields
    #[must_use]
    pub fn failure(
        kind: MessageType,
        event: impl Into<String>,
        device_id: Option<DeviceId>,
        play_id: Option<PlayId>,
        error_msg: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            event: event.into(),
            device_id,
            play_id,
            code: CODE_FAILURE,
            data: serde_json::Value::Null,
            error_msg: Some(error_msg.into()),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Frames carrying a `playId` that are not device-originated requests
    /// are acknowledgements of a gateway command.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.play_id.is_some() && self.kind != MessageType::DeviceControl
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// WebSocket close codes sent when the gateway ends a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    InvalidPayload,
    PolicyViolation,
    InternalError,
    HeartbeatTimeout,
    Superseded,
}

impl CloseCode {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::InternalError => 1011,
            Self::HeartbeatTimeout => 4000,
            Self::Superseded => 4001,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_control_request() {
        let env = Envelope::from_json(
            r#"{"type":"control","playId":"P1","deviceId":"D1","event":"start_rtmp","data":{"stream_res":"720P"}}"#,
        )
        .unwrap();

        assert_eq!(env.kind, MessageType::Control);
        assert_eq!(env.event, events::START_RTMP);
        assert_eq!(env.play_id, Some(PlayId::from("P1")));
        assert_eq!(env.device_id, Some(DeviceId::from("D1")));
        assert_eq!(env.code, CODE_SUCCESS);
        assert_eq!(env.data["stream_res"], "720P");
        assert!(env.is_ack());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let env = Envelope::from_json(r#"{"event":"join"}"#).unwrap();
        assert_eq!(env.kind, MessageType::Notify);
        assert!(env.play_id.is_none());
        assert!(env.data.is_null());
        assert!(!env.is_ack());
    }

    #[test]
    fn test_notify_reply_with_play_id_is_ack() {
        let env = Envelope::from_json(
            r#"{"type":"notify","event":"start_rtmp","playId":"P1","code":0,"data":{"status":"streaming_started"}}"#,
        )
        .unwrap();
        assert_eq!(env.kind, MessageType::Notify);
        assert!(env.is_ack());
    }

    #[test]
    fn test_device_control_with_play_id_is_not_ack() {
        let env = Envelope::new(MessageType::DeviceControl, events::GET_RTMP)
            .with_play_id(PlayId::from("X"));
        assert!(!env.is_ack());
    }

    #[test]
    fn test_failure_serialization_omits_empty_fields() {
        let env = Envelope::failure(
            MessageType::Control,
            events::STOP_RTMP,
            Some(DeviceId::from("D1")),
            None,
            "device offline",
        );
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "control",
                "event": "stop_rtmp",
                "deviceId": "D1",
                "code": -1,
                "error_msg": "device offline"
            })
        );
    }

    #[test]
    fn test_rejects_unknown_type() {
        assert!(Envelope::from_json(r#"{"type":"bogus","event":"join"}"#).is_err());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::InvalidPayload.as_u16(), 1007);
        assert_eq!(CloseCode::HeartbeatTimeout.as_u16(), 4000);
        assert_eq!(CloseCode::Superseded.as_u16(), 4001);
    }
}
