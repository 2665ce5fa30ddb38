pub mod envelope;
pub mod id;

pub use envelope::{events, CloseCode, Envelope, MessageType, CODE_FAILURE, CODE_SUCCESS};
pub use id::{generate_id, ConnectionId, DeviceId, DeviceSn, PlayId, RoomId};
