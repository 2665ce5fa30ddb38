//! Redis-backed device directory
//!
//! Each device lives under `{prefix}device:{device_id}` as a JSON
//! [`DirectoryEntry`] written with `SET .. EX ttl`.

use async_trait::async_trait;
use driftsee_core::models::{ConnectionId, DeviceId};
use redis::aio::ConnectionManager as RedisConnectionManager;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use super::{DeviceDirectory, DirectoryEntry};
use crate::error::{Error, Result};

/// Delete the key only if its entry still names the given connection
const REMOVE_IF_OWNER_SCRIPT: &str = r"
local existing = redis.call('GET', KEYS[1])
if not existing then
    return 0
end
local entry = cjson.decode(existing)
if entry.connection_id == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

#[derive(Clone)]
pub struct RedisDeviceDirectory {
    redis: RedisConnectionManager,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisDeviceDirectory {
    #[must_use]
    pub const fn new(redis: RedisConnectionManager, key_prefix: String, op_timeout: Duration) -> Self {
        Self {
            redis,
            key_prefix,
            op_timeout,
        }
    }

    /// Open a managed connection to `redis_url`
    pub async fn connect(redis_url: &str, key_prefix: String, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;
        let redis = timeout(op_timeout, RedisConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;
        Ok(Self::new(redis, key_prefix, op_timeout))
    }

    fn device_key(&self, device_id: &DeviceId) -> String {
        format!("{}device:{}", self.key_prefix, device_id)
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("Redis {op} timed out")))?
            .map_err(|e| Error::Redis(format!("Redis {op} failed: {e}")))
    }
}

#[async_trait]
impl DeviceDirectory for RedisDeviceDirectory {
    async fn publish(&self, entry: &DirectoryEntry, ttl: Duration) -> Result<()> {
        let key = self.device_key(&entry.device_id);
        let value = serde_json::to_string(entry)?;
        let mut conn = self.redis.clone();

        self.bounded(
            "SET",
            redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query_async::<()>(&mut conn),
        )
        .await?;

        tracing::trace!(key = %key, node_id = %entry.node_id, "Directory entry published");
        Ok(())
    }

    async fn lookup(&self, device_id: &DeviceId) -> Result<Option<DirectoryEntry>> {
        let key = self.device_key(device_id);
        let mut conn = self.redis.clone();

        let raw: Option<String> = self
            .bounded("GET", redis::cmd("GET").arg(&key).query_async(&mut conn))
            .await?;

        raw.map(|json| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    async fn remove(&self, device_id: &DeviceId, connection_id: &ConnectionId) -> Result<bool> {
        let key = self.device_key(device_id);
        let mut conn = self.redis.clone();
        let script = redis::Script::new(REMOVE_IF_OWNER_SCRIPT);

        let deleted: i32 = self
            .bounded(
                "remove script",
                script
                    .key(&key)
                    .arg(connection_id.as_str())
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn directory() -> RedisDeviceDirectory {
        RedisDeviceDirectory::connect(
            "redis://localhost:6379",
            format!("driftsee-test-{}:", driftsee_core::models::generate_id()),
            Duration::from_secs(2),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_publish_lookup_remove() {
        let dir = directory().await;
        let device = DeviceId::from("D1");
        let conn = ConnectionId::new();
        let entry = DirectoryEntry::new(device.clone(), "node-a".to_string(), conn.clone());

        dir.publish(&entry, Duration::from_secs(30)).await.unwrap();
        assert_eq!(dir.lookup(&device).await.unwrap(), Some(entry));

        assert!(!dir.remove(&device, &ConnectionId::new()).await.unwrap());
        assert!(dir.remove(&device, &conn).await.unwrap());
        assert!(dir.lookup(&device).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_lookup_missing_device() {
        let dir = directory().await;
        assert!(dir.lookup(&DeviceId::from("nobody")).await.unwrap().is_none());
    }
}
