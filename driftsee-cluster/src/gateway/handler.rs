use async_trait::async_trait;
use driftsee_core::config::MediaConfig;
use driftsee_core::models::{events, ConnectionId, Envelope, MessageType};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use crate::registry::{ConnectionRegistry, DeviceAddress};

/// Which connection a frame arrived on
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub connection_id: ConnectionId,
    pub address: DeviceAddress,
}

/// Semantics for device frames that are not command acknowledgements
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceMessageHandler: Send + Sync {
    /// Handle one frame. A returned envelope is sent back on the same connection.
    async fn handle(&self, ctx: &DeviceContext, envelope: Envelope) -> Option<Envelope>;
}

/// Built-in handling for the events devices send on their own
pub struct DefaultDeviceHandler {
    registry: Arc<ConnectionRegistry>,
    media: MediaConfig,
}

impl DefaultDeviceHandler {
    #[must_use]
    pub const fn new(registry: Arc<ConnectionRegistry>, media: MediaConfig) -> Self {
        Self { registry, media }
    }

    /// Where a device should push its video
    #[must_use]
    pub fn rtmp_url(&self, address: &DeviceAddress) -> String {
        format!(
            "rtmp://{}:{}/{}/{}",
            self.media.video_rtmp_host, self.media.video_rtmp_port, address.room_id, address.device_id
        )
    }
}

#[async_trait]
impl DeviceMessageHandler for DefaultDeviceHandler {
    async fn handle(&self, ctx: &DeviceContext, envelope: Envelope) -> Option<Envelope> {
        match (envelope.kind, envelope.event.as_str()) {
            (_, events::JOIN) => {
                info!(
                    connection_id = %ctx.connection_id,
                    device_id = %ctx.address.device_id,
                    "Device joined"
                );
                None
            }
            (_, events::DEVICE_INFO) => {
                self.registry.set_device_info(&ctx.connection_id, envelope.data);
                debug!(device_id = %ctx.address.device_id, "Device info updated");
                None
            }
            (MessageType::DeviceControl, events::GET_RTMP) => {
                let mut reply = Envelope::new(MessageType::DeviceNotify, events::GET_RTMP)
                    .with_device(ctx.address.device_id.clone())
                    .with_data(json!({ "rtmp_url": self.rtmp_url(&ctx.address) }));
                reply.play_id = envelope.play_id;
                Some(reply)
            }
            (kind, event) => {
                debug!(
                    device_id = %ctx.address.device_id,
                    kind = ?kind,
                    event,
                    "Unhandled device message"
                );
                None
            }
        }
    }
}
