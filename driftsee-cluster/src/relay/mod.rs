//! Cross-node command forwarding
//!
//! When the directory says another node owns a device, the command is handed
//! to that node and the origin waits for the result. The owner confirms
//! receipt first so a dead node is detected quickly instead of at the
//! command deadline.

mod in_process;
mod redis_relay;

pub use in_process::InProcessRelay;
pub use redis_relay::RedisCommandRelay;

use async_trait::async_trait;
use driftsee_core::models::{DeviceId, Envelope};
use std::sync::Weak;
use std::time::Duration;

use crate::control::ControlResult;
use crate::directory::DirectoryEntry;

/// Executes forwarded commands against connections held by this node
#[async_trait]
pub trait ForwardTarget: Send + Sync {
    /// Run a command on a local connection. Never forwards again.
    async fn execute_local(
        &self,
        device_id: &DeviceId,
        envelope: Envelope,
        budget: Duration,
    ) -> ControlResult;
}

#[async_trait]
pub trait CommandRelay: Send + Sync {
    /// Send `envelope` to the node named by `owner` and wait up to `budget`
    /// for the device's answer
    async fn forward(&self, owner: &DirectoryEntry, envelope: Envelope, budget: Duration)
        -> ControlResult;

    /// Register the executor for commands addressed to `node_id`
    fn attach(&self, node_id: &str, target: Weak<dyn ForwardTarget>);
}
