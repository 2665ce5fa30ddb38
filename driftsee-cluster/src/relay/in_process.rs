use async_trait::async_trait;
use dashmap::DashMap;
use driftsee_core::models::Envelope;
use std::sync::Weak;
use std::time::Duration;

use super::{CommandRelay, ForwardTarget};
use crate::control::{ControlError, ControlResult};
use crate::directory::DirectoryEntry;

/// Relay connecting several gateways inside one process
///
/// Share one instance between the gateways of a test cluster; each gateway
/// attaches under its node id.
#[derive(Default)]
pub struct InProcessRelay {
    nodes: DashMap<String, Weak<dyn ForwardTarget>>,
}

impl InProcessRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a node, as if its process died
    pub fn detach(&self, node_id: &str) {
        self.nodes.remove(node_id);
    }
}

#[async_trait]
impl CommandRelay for InProcessRelay {
    async fn forward(
        &self,
        owner: &DirectoryEntry,
        envelope: Envelope,
        budget: Duration,
    ) -> ControlResult {
        let target = self
            .nodes
            .get(&owner.node_id)
            .and_then(|t| t.value().upgrade());

        let Some(target) = target else {
            tracing::debug!(node_id = %owner.node_id, "No such node attached");
            return Err(ControlError::Offline(owner.device_id.clone()));
        };

        target.execute_local(&owner.device_id, envelope, budget).await
    }

    fn attach(&self, node_id: &str, target: Weak<dyn ForwardTarget>) {
        self.nodes.insert(node_id.to_string(), target);
    }
}
