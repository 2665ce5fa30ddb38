use async_trait::async_trait;
use dashmap::DashMap;
use driftsee_core::models::{ConnectionId, DeviceId};
use std::time::Duration;
use tokio::time::Instant;

use super::{DeviceDirectory, DirectoryEntry};
use crate::error::Result;

/// In-memory directory for single-instance deployments and tests
#[derive(Default)]
pub struct LocalDeviceDirectory {
    entries: DashMap<DeviceId, (DirectoryEntry, Instant)>,
}

impl LocalDeviceDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DeviceDirectory for LocalDeviceDirectory {
    async fn publish(&self, entry: &DirectoryEntry, ttl: Duration) -> Result<()> {
        self.entries
            .insert(entry.device_id.clone(), (entry.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn lookup(&self, device_id: &DeviceId) -> Result<Option<DirectoryEntry>> {
        let now = Instant::now();
        // Expired entries are dropped lazily, like a key TTL
        self.entries.remove_if(device_id, |_, (_, expires_at)| *expires_at <= now);
        Ok(self.entries.get(device_id).map(|e| e.value().0.clone()))
    }

    async fn remove(&self, device_id: &DeviceId, connection_id: &ConnectionId) -> Result<bool> {
        Ok(self
            .entries
            .remove_if(device_id, |_, (entry, _)| &entry.connection_id == connection_id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(device: &str, conn: &str) -> DirectoryEntry {
        DirectoryEntry::new(
            DeviceId::from(device),
            "node-a".to_string(),
            ConnectionId::from(conn),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let dir = LocalDeviceDirectory::new();
        dir.publish(&entry("D1", "c1"), Duration::from_secs(90))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(dir.lookup(&DeviceId::from("D1")).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(dir.lookup(&DeviceId::from("D1")).await.unwrap().is_none());
        assert!(dir.is_empty());
    }

    #[tokio::test]
    async fn test_remove_only_matching_connection() {
        let dir = LocalDeviceDirectory::new();
        let device = DeviceId::from("D1");
        dir.publish(&entry("D1", "c2"), Duration::from_secs(90))
            .await
            .unwrap();

        // A late removal from the superseded connection must not drop the new entry
        assert!(!dir.remove(&device, &ConnectionId::from("c1")).await.unwrap());
        assert!(dir.lookup(&device).await.unwrap().is_some());

        assert!(dir.remove(&device, &ConnectionId::from("c2")).await.unwrap());
        assert!(dir.lookup(&device).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_is_idempotent() {
        let dir = LocalDeviceDirectory::new();
        let e = entry("D1", "c1");
        dir.publish(&e, Duration::from_secs(90)).await.unwrap();
        dir.publish(&e, Duration::from_secs(90)).await.unwrap();
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.lookup(&e.device_id).await.unwrap(), Some(e));
    }
}
