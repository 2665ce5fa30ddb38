pub mod connection_registry;
pub mod heartbeat_monitor;

pub use connection_registry::{
    ConnectionHandle, ConnectionRegistry, ConnectionSummary, DeviceAddress, Outbound,
    RegistryOptions, Transport,
};
pub use heartbeat_monitor::{HeartbeatMonitor, SweepReport, HEARTBEAT_TIMEOUT_REASON};
