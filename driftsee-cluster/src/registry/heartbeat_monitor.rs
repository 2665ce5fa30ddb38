//! Liveness sweep for device connections
//!
//! Evicts connections that have been silent past the heartbeat timeout and
//! refreshes directory entries for everything that survives.

use driftsee_core::models::CloseCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection_registry::ConnectionRegistry;

pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Outcome of a single sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub refreshed: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    check_interval: Duration,
    heartbeat_timeout: Duration,
    cancel_token: CancellationToken,
}

impl HeartbeatMonitor {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        check_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            check_interval,
            heartbeat_timeout,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Start the sweep loop
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task completion.
    /// Use `shutdown()` to stop the loop.
    #[must_use]
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let heartbeat_timeout = self.heartbeat_timeout;
        let cancel_token = self.cancel_token.clone();

        let mut timer = interval(self.check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            // The first tick completes immediately; nothing can be stale yet
            timer.tick().await;
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Heartbeat monitor shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        Self::sweep(&registry, heartbeat_timeout).await;
                    }
                }
            }
        })
    }

    /// Evict silent connections, then refresh directory entries for the rest
    pub async fn sweep(registry: &ConnectionRegistry, heartbeat_timeout: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        // Candidates only: each one is re-checked at removal time, since a
        // frame may arrive while an earlier eviction waits on the directory
        for connection_id in registry.stale(heartbeat_timeout) {
            let evicted = registry
                .evict_if_silent(
                    &connection_id,
                    heartbeat_timeout,
                    HEARTBEAT_TIMEOUT_REASON,
                    CloseCode::HeartbeatTimeout,
                )
                .await;
            if evicted {
                tracing::warn!(
                    connection_id = %connection_id,
                    timeout = ?heartbeat_timeout,
                    "Connection missed heartbeat"
                );
                report.evicted += 1;
            }
        }

        report.refreshed = registry.republish_all().await;

        tracing::debug!(
            evicted = report.evicted,
            refreshed = report.refreshed,
            "Heartbeat sweep finished"
        );
        report
    }

    /// Gracefully shut down the sweep loop
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DeviceDirectory, DirectoryEntry, LocalDeviceDirectory};
    use crate::error::Result;
    use crate::registry::{DeviceAddress, Outbound, RegistryOptions, Transport};
    use async_trait::async_trait;
    use driftsee_core::models::{ConnectionId, DeviceId, DeviceSn, RoomId};

    /// Directory whose removals take a while, like a congested Redis
    struct SlowDirectory {
        inner: LocalDeviceDirectory,
        remove_delay: Duration,
    }

    #[async_trait]
    impl DeviceDirectory for SlowDirectory {
        async fn publish(&self, entry: &DirectoryEntry, ttl: Duration) -> Result<()> {
            self.inner.publish(entry, ttl).await
        }

        async fn lookup(&self, device_id: &DeviceId) -> Result<Option<DirectoryEntry>> {
            self.inner.lookup(device_id).await
        }

        async fn remove(&self, device_id: &DeviceId, connection_id: &ConnectionId) -> Result<bool> {
            tokio::time::sleep(self.remove_delay).await;
            self.inner.remove(device_id, connection_id).await
        }
    }

    fn address(device: &str) -> DeviceAddress {
        DeviceAddress {
            room_id: RoomId::from("R1"),
            device_sn: DeviceSn::from("SN"),
            device_id: DeviceId::from(device),
            language: "en".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_silent_connections() {
        let directory = Arc::new(LocalDeviceDirectory::new());
        let registry = ConnectionRegistry::new("node-a", directory.clone(), RegistryOptions::default());
        let (t1, mut rx1) = Transport::channel(4);
        let (t2, _rx2) = Transport::channel(4);
        let silent = registry.admit(t1, address("D1")).await;
        let active = registry.admit(t2, address("D2")).await;

        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(30)).await;
            registry.touch(&active.connection_id);
        }

        let report = HeartbeatMonitor::sweep(&registry, Duration::from_secs(180)).await;
        assert_eq!(report, SweepReport { evicted: 1, refreshed: 1 });
        assert!(silent.closed.is_cancelled());
        assert!(registry.contains(&active.connection_id));
        assert_eq!(
            rx1.recv().await,
            Some(Outbound::Close {
                code: CloseCode::HeartbeatTimeout,
                reason: HEARTBEAT_TIMEOUT_REASON.to_string()
            })
        );
        assert!(directory.lookup(&DeviceId::from("D1")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_directory_entries_alive() {
        let directory = Arc::new(LocalDeviceDirectory::new());
        let options = RegistryOptions {
            directory_ttl: Duration::from_secs(90),
            directory_timeout: Duration::from_secs(2),
        };
        let registry = ConnectionRegistry::new("node-a", directory.clone(), options);
        let (transport, _rx) = Transport::channel(4);
        let handle = registry.admit(transport, address("D1")).await;

        // Past the TTL, but refreshed by sweeps on the way
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(30)).await;
            registry.touch(&handle.connection_id);
            HeartbeatMonitor::sweep(&registry, Duration::from_secs(180)).await;
        }

        assert!(directory.lookup(&DeviceId::from("D1")).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_during_sweep_spares_the_connection() {
        let directory = Arc::new(SlowDirectory {
            inner: LocalDeviceDirectory::new(),
            remove_delay: Duration::from_millis(1500),
        });
        let registry = Arc::new(ConnectionRegistry::new(
            "node-a",
            directory,
            RegistryOptions::default(),
        ));
        let (t1, _rx1) = Transport::channel(4);
        let (t2, _rx2) = Transport::channel(4);
        let first = registry.admit(t1, address("D1")).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        let second = registry.admit(t2, address("D2")).await;

        // Both silent past the timeout; D1 longer, so it is evicted first
        tokio::time::advance(Duration::from_secs(181)).await;

        let sweeping = registry.clone();
        let sweep = tokio::spawn(async move {
            HeartbeatMonitor::sweep(&sweeping, Duration::from_secs(180)).await
        });

        // D2 speaks while D1's directory removal is still in flight
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.touch(&second.connection_id));

        let report = sweep.await.unwrap();
        assert_eq!(report, SweepReport { evicted: 1, refreshed: 1 });
        assert!(first.closed.is_cancelled());
        assert!(!second.closed.is_cancelled());
        assert!(registry.contains(&second.connection_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_loop_runs_and_shuts_down() {
        let directory = Arc::new(LocalDeviceDirectory::new());
        let registry = Arc::new(ConnectionRegistry::new(
            "node-a",
            directory,
            RegistryOptions::default(),
        ));
        let (transport, _rx) = Transport::channel(4);
        let handle = registry.admit(transport, address("D1")).await;

        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            Duration::from_secs(30),
            Duration::from_secs(180),
        );
        let task = monitor.start();

        tokio::time::sleep(Duration::from_secs(211)).await;
        assert!(handle.closed.is_cancelled());
        assert!(registry.is_empty());

        monitor.shutdown();
        task.await.unwrap();
    }
}
