//! Gateway facade
//!
//! The one surface the HTTP layer talks to: device sockets report their
//! frames here, and control requests enter through [`Gateway::submit_control`].

mod handler;

pub use handler::{DefaultDeviceHandler, DeviceContext, DeviceMessageHandler};
#[cfg(test)]
pub use handler::MockDeviceMessageHandler;

use driftsee_core::models::{
    events, CloseCode, ConnectionId, DeviceId, Envelope, RoomId,
};
use driftsee_core::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::control::{ControlCorrelator, ControlResult, CorrelatorOptions};
use crate::directory::DeviceDirectory;
use crate::registry::{
    ConnectionHandle, ConnectionRegistry, ConnectionSummary, DeviceAddress, HeartbeatMonitor,
    RegistryOptions, Transport,
};
use crate::relay::{CommandRelay, ForwardTarget};

pub const SHUTDOWN_REASON: &str = "server shutdown";

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(180),
            max_frame_bytes: 64 * 1024,
        }
    }
}

pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<ControlCorrelator>,
    handler: Arc<dyn DeviceMessageHandler>,
    options: GatewayOptions,
}

impl Gateway {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<ControlCorrelator>,
        handler: Arc<dyn DeviceMessageHandler>,
        options: GatewayOptions,
    ) -> Self {
        Self {
            registry,
            correlator,
            handler,
            options,
        }
    }

    /// Wire up registry, correlator and the default device handler from configuration.
    /// The relay, if any, gets this node's correlator as its forwarding target.
    #[must_use]
    pub fn from_config(
        node_id: &str,
        config: &Config,
        directory: Arc<dyn DeviceDirectory>,
        relay: Option<Arc<dyn CommandRelay>>,
    ) -> Self {
        let gw = &config.gateway;

        let registry = Arc::new(ConnectionRegistry::new(
            node_id,
            directory.clone(),
            RegistryOptions {
                directory_ttl: gw.directory_ttl(),
                directory_timeout: gw.directory_timeout(),
            },
        ));
        let correlator = Arc::new(ControlCorrelator::new(
            registry.clone(),
            directory,
            relay.clone(),
            CorrelatorOptions {
                default_timeout: gw.command_timeout(),
                max_timeout: gw.max_command_timeout(),
                max_queued_commands: gw.max_queued_commands,
                directory_timeout: gw.directory_timeout(),
                stale_after: gw.heartbeat_timeout(),
            },
        ));
        if let Some(relay) = relay {
            let target: Arc<dyn ForwardTarget> = correlator.clone();
            relay.attach(node_id, Arc::downgrade(&target));
        }

        let handler = Arc::new(DefaultDeviceHandler::new(registry.clone(), config.media.clone()));

        Self::new(
            registry,
            correlator,
            handler,
            GatewayOptions {
                heartbeat_interval: gw.heartbeat_interval(),
                heartbeat_timeout: gw.heartbeat_timeout(),
                max_frame_bytes: gw.max_frame_bytes,
            },
        )
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn correlator(&self) -> &Arc<ControlCorrelator> {
        &self.correlator
    }

    #[must_use]
    pub fn heartbeat_monitor(&self) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            self.registry.clone(),
            self.options.heartbeat_interval,
            self.options.heartbeat_timeout,
        )
    }

    pub async fn connect(&self, transport: Transport, address: DeviceAddress) -> ConnectionHandle {
        self.registry.admit(transport, address).await
    }

    pub async fn disconnect(&self, connection_id: &ConnectionId, reason: &str, code: CloseCode) {
        self.registry.evict(connection_id, reason, code).await;
    }

    /// Handle a raw text frame. Oversized or undecodable frames close the connection.
    pub async fn on_raw_frame(&self, connection_id: &ConnectionId, text: &str) {
        if text.len() > self.options.max_frame_bytes {
            warn!(connection_id = %connection_id, size = text.len(), "Frame too large");
            self.registry
                .evict(connection_id, "frame too large", CloseCode::PolicyViolation)
                .await;
            return;
        }

        match Envelope::from_json(text) {
            Ok(envelope) => self.on_device_frame(connection_id, envelope).await,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Malformed frame");
                self.registry
                    .evict(connection_id, "malformed message", CloseCode::InvalidPayload)
                    .await;
            }
        }
    }

    /// Handle a decoded device frame
    ///
    /// Any frame counts as liveness. Acknowledgements go to the correlator and
    /// stop there; everything else goes to the device message handler.
    pub async fn on_device_frame(&self, connection_id: &ConnectionId, envelope: Envelope) {
        if !self.registry.touch(connection_id) {
            debug!(connection_id = %connection_id, "Frame from unknown connection ignored");
            return;
        }
        let Some(address) = self.registry.address(connection_id) else {
            return;
        };

        if envelope.is_ack() {
            // A status report that answers a query still updates the cached status
            if envelope.event == events::DEVICE_INFO && envelope.is_success() {
                self.registry
                    .set_device_info(connection_id, envelope.data.clone());
            }
            if let Some(play_id) = envelope.play_id.clone() {
                // Trust the connection's identity, not the frame's deviceId field
                self.correlator.resolve(&address.device_id, &play_id, envelope);
            }
            return;
        }

        let ctx = DeviceContext {
            connection_id: connection_id.clone(),
            address,
        };
        if let Some(reply) = self.handler.handle(&ctx, envelope).await {
            if let Err(e) = self.registry.send(connection_id, reply).await {
                warn!(connection_id = %connection_id, error = %e, "Failed to send reply");
            }
        }
    }

    /// Run a control command against a device, wherever it is connected
    pub async fn submit_control(
        &self,
        device_id: &DeviceId,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> ControlResult {
        self.correlator.dispatch(device_id, envelope, timeout).await
    }

    #[must_use]
    pub fn list_devices(&self, room_id: Option<&RoomId>) -> Vec<ConnectionSummary> {
        self.registry.list(room_id)
    }

    #[must_use]
    pub fn connected_devices(&self) -> usize {
        self.registry.len()
    }

    /// Close every device connection with a normal close
    pub async fn shutdown(&self) -> usize {
        self.registry.evict_all(SHUTDOWN_REASON, CloseCode::Normal).await
    }
}
