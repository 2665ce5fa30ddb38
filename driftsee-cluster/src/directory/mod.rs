//! Shared device directory
//!
//! Maps a device id to the gateway node that currently holds its socket.
//! Entries are advisory: they expire on their own and are re-published on
//! every heartbeat tick, so readers must treat them as hints.

mod local_directory;
mod redis_directory;

pub use local_directory::LocalDeviceDirectory;
pub use redis_directory::RedisDeviceDirectory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftsee_core::models::{ConnectionId, DeviceId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Directory record naming the owner of a device connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub device_id: DeviceId,
    pub node_id: String,
    pub connection_id: ConnectionId,
    pub published_at: DateTime<Utc>,
}

impl DirectoryEntry {
    #[must_use]
    pub fn new(device_id: DeviceId, node_id: String, connection_id: ConnectionId) -> Self {
        Self {
            device_id,
            node_id,
            connection_id,
            published_at: Utc::now(),
        }
    }

    /// An entry not refreshed within `max_age` must not be used for routing
    #[must_use]
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.published_at);
        elapsed.to_std().is_ok_and(|age| age > max_age)
    }
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Write or refresh an entry. Idempotent.
    async fn publish(&self, entry: &DirectoryEntry, ttl: Duration) -> Result<()>;

    async fn lookup(&self, device_id: &DeviceId) -> Result<Option<DirectoryEntry>>;

    /// Delete the entry only while it still names `connection_id`.
    /// Returns whether anything was deleted.
    async fn remove(&self, device_id: &DeviceId, connection_id: &ConnectionId) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_staleness() {
        let mut entry = DirectoryEntry::new(
            DeviceId::from("D1"),
            "node-a".to_string(),
            ConnectionId::new(),
        );
        assert!(!entry.is_stale(Duration::from_secs(180)));

        entry.published_at = Utc::now() - chrono::Duration::seconds(181);
        assert!(entry.is_stale(Duration::from_secs(180)));
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = DirectoryEntry::new(
            DeviceId::from("D1"),
            "node-a".to_string(),
            ConnectionId::from("c1"),
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["device_id"], "D1");
        assert_eq!(value["node_id"], "node-a");
        assert_eq!(value["connection_id"], "c1");
    }
}
