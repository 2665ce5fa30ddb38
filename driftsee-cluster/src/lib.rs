pub mod control;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod relay;

pub use control::{ControlCorrelator, ControlError, ControlResult, CorrelatorOptions};
pub use directory::{DeviceDirectory, DirectoryEntry, LocalDeviceDirectory, RedisDeviceDirectory};
pub use error::{Error, Result};
pub use gateway::{
    DefaultDeviceHandler, DeviceContext, DeviceMessageHandler, Gateway, GatewayOptions,
};
pub use registry::{
    ConnectionHandle, ConnectionRegistry, ConnectionSummary, DeviceAddress, HeartbeatMonitor,
    Outbound, RegistryOptions, Transport,
};
pub use relay::{CommandRelay, ForwardTarget, InProcessRelay, RedisCommandRelay};
