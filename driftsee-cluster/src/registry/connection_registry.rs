use chrono::{DateTime, Utc};
use dashmap::DashMap;
use driftsee_core::models::{
    CloseCode, ConnectionId, DeviceId, DeviceSn, Envelope, RoomId,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::{DeviceDirectory, DirectoryEntry};
use crate::error::{Error, Result};

/// Item queued for the socket writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Envelope),
    Close { code: CloseCode, reason: String },
}

/// Send half of a device socket. The registry is the only writer.
#[derive(Debug, Clone)]
pub struct Transport {
    tx: mpsc::Sender<Outbound>,
}

impl Transport {
    #[must_use]
    pub const fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    /// Bounded transport plus the receiver the socket writer drains
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

/// Where a device says it is, taken from the handshake path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceAddress {
    pub room_id: RoomId,
    pub device_sn: DeviceSn,
    pub device_id: DeviceId,
    pub language: String,
}

/// Handle returned on admission and by device lookups
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub device_id: DeviceId,
    /// Cancelled once the connection leaves the registry
    pub closed: CancellationToken,
}

struct Connection {
    address: DeviceAddress,
    transport: Transport,
    connected_at: DateTime<Utc>,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    frames_received: u64,
    device_info: Option<serde_json::Value>,
    closed: CancellationToken,
}

/// Point-in-time view of a connection for listings
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub room_id: RoomId,
    pub device_sn: DeviceSn,
    pub device_id: DeviceId,
    pub language: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub frames_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<serde_json::Value>,
}

/// Registry timing knobs for directory writes
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub directory_ttl: Duration,
    pub directory_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            directory_ttl: Duration::from_secs(90),
            directory_timeout: Duration::from_secs(2),
        }
    }
}

/// Table of live device sessions held by this node
///
/// At most one connection per device id is active. Admitting a device that
/// is already connected retires the older session with [`CloseCode::Superseded`].
/// Every eviction cancels the connection's `closed` token, which is how
/// in-flight control commands learn that their target went away.
pub struct ConnectionRegistry {
    node_id: String,
    connections: DashMap<ConnectionId, Connection>,
    by_device: DashMap<DeviceId, ConnectionId>,
    directory: Arc<dyn DeviceDirectory>,
    options: RegistryOptions,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        directory: Arc<dyn DeviceDirectory>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            connections: DashMap::new(),
            by_device: DashMap::new(),
            directory,
            options,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Register a freshly handshaken device socket
    pub async fn admit(&self, transport: Transport, address: DeviceAddress) -> ConnectionHandle {
        let connection_id = ConnectionId::new();
        let device_id = address.device_id.clone();
        let closed = CancellationToken::new();
        let now = Utc::now();

        info!(
            connection_id = %connection_id,
            device_id = %device_id,
            room_id = %address.room_id,
            device_sn = %address.device_sn,
            language = %address.language,
            "Device connected"
        );

        self.connections.insert(
            connection_id.clone(),
            Connection {
                address,
                transport,
                connected_at: now,
                last_seen: Instant::now(),
                last_seen_at: now,
                frames_received: 0,
                device_info: None,
                closed: closed.clone(),
            },
        );

        let previous = self
            .by_device
            .insert(device_id.clone(), connection_id.clone());
        if let Some(previous) = previous.filter(|p| p != &connection_id) {
            info!(
                device_id = %device_id,
                previous = %previous,
                current = %connection_id,
                "Retiring superseded connection"
            );
            self.evict(&previous, "superseded by a new connection", CloseCode::Superseded)
                .await;
        }

        self.publish(&device_id, &connection_id).await;

        ConnectionHandle {
            connection_id,
            device_id,
            closed,
        }
    }

    /// Record inbound activity. Returns false for unknown connections.
    pub fn touch(&self, connection_id: &ConnectionId) -> bool {
        self.connections.get_mut(connection_id).is_some_and(|mut conn| {
            conn.last_seen = Instant::now();
            conn.last_seen_at = Utc::now();
            conn.frames_received += 1;
            true
        })
    }

    /// Queue a frame without waiting. A full or closed transport evicts the
    /// connection and reports [`Error::Transport`].
    pub async fn send(&self, connection_id: &ConnectionId, envelope: Envelope) -> Result<()> {
        let transport = self
            .connections
            .get(connection_id)
            .map(|conn| conn.transport.clone())
            .ok_or_else(|| Error::NotFound(format!("connection {connection_id}")))?;

        match transport.tx.try_send(Outbound::Frame(envelope)) {
            Ok(()) => Ok(()),
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "outbound buffer full",
                    mpsc::error::TrySendError::Closed(_) => "transport closed",
                };
                warn!(connection_id = %connection_id, reason, "Send failed, evicting connection");
                self.evict(connection_id, reason, CloseCode::InternalError).await;
                Err(Error::Transport(reason.to_string()))
            }
        }
    }

    /// Remove a connection, close its transport and withdraw its directory entry.
    /// Returns false if the connection was already gone.
    pub async fn evict(&self, connection_id: &ConnectionId, reason: &str, code: CloseCode) -> bool {
        let Some((_, conn)) = self.connections.remove(connection_id) else {
            return false;
        };
        self.retire(connection_id, conn, reason, code).await;
        true
    }

    /// Evict a connection only if it is still silent for longer than `max_silence`.
    /// The silence check and the removal happen under the same shard lock, so a
    /// frame that lands before the removal keeps the connection alive.
    pub async fn evict_if_silent(
        &self,
        connection_id: &ConnectionId,
        max_silence: Duration,
        reason: &str,
        code: CloseCode,
    ) -> bool {
        let removed = self.connections.remove_if(connection_id, |_, conn| {
            Instant::now().duration_since(conn.last_seen) > max_silence
        });
        let Some((_, conn)) = removed else {
            return false;
        };
        self.retire(connection_id, conn, reason, code).await;
        true
    }

    async fn retire(&self, connection_id: &ConnectionId, conn: Connection, reason: &str, code: CloseCode) {
        let device_id = conn.address.device_id.clone();

        self.by_device.remove_if(&device_id, |_, current| current == connection_id);
        conn.closed.cancel();

        // Best effort: the writer may already be gone
        let _ = conn.transport.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });

        info!(
            connection_id = %connection_id,
            device_id = %device_id,
            close_code = code.as_u16(),
            reason,
            frames_received = conn.frames_received,
            connected_for = ?Utc::now().signed_duration_since(conn.connected_at),
            "Connection evicted"
        );

        match timeout(
            self.options.directory_timeout,
            self.directory.remove(&device_id, connection_id),
        )
        .await
        {
            Ok(Ok(removed)) => {
                debug!(device_id = %device_id, removed, "Directory entry withdrawn");
            }
            Ok(Err(e)) => {
                warn!(device_id = %device_id, error = %e, "Failed to remove directory entry");
            }
            Err(_) => {
                warn!(device_id = %device_id, "Directory remove timed out");
            }
        }
    }

    /// Evict every connection, e.g. on shutdown. Returns how many were closed.
    pub async fn evict_all(&self, reason: &str, code: CloseCode) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| e.key().clone()).collect();
        let mut evicted = 0;
        for id in ids {
            if self.evict(&id, reason, code).await {
                evicted += 1;
            }
        }
        evicted
    }

    /// Snapshot of live connections, optionally filtered by room, ordered by connection id
    #[must_use]
    pub fn list(&self, room_id: Option<&RoomId>) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .connections
            .iter()
            .filter(|e| room_id.is_none_or(|room| &e.value().address.room_id == room))
            .map(|e| {
                let conn = e.value();
                ConnectionSummary {
                    connection_id: e.key().clone(),
                    room_id: conn.address.room_id.clone(),
                    device_sn: conn.address.device_sn.clone(),
                    device_id: conn.address.device_id.clone(),
                    language: conn.address.language.clone(),
                    connected_at: conn.connected_at,
                    last_seen_at: conn.last_seen_at,
                    frames_received: conn.frames_received,
                    device_info: conn.device_info.clone(),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        summaries
    }

    /// Active connection for a device on this node
    #[must_use]
    pub fn get_by_device(&self, device_id: &DeviceId) -> Option<ConnectionHandle> {
        let connection_id = self.by_device.get(device_id)?.value().clone();
        let closed = self.connections.get(&connection_id)?.closed.clone();
        Some(ConnectionHandle {
            connection_id,
            device_id: device_id.clone(),
            closed,
        })
    }

    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    #[must_use]
    pub fn address(&self, connection_id: &ConnectionId) -> Option<DeviceAddress> {
        self.connections
            .get(connection_id)
            .map(|conn| conn.address.clone())
    }

    /// Cache the latest status report a device sent about itself
    pub fn set_device_info(&self, connection_id: &ConnectionId, info: serde_json::Value) -> bool {
        self.connections.get_mut(connection_id).is_some_and(|mut conn| {
            conn.device_info = Some(info);
            true
        })
    }

    /// Connections silent for longer than `max_silence`, longest silence first
    #[must_use]
    pub fn stale(&self, max_silence: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let mut silent: Vec<(Instant, ConnectionId)> = self
            .connections
            .iter()
            .filter(|e| now.duration_since(e.value().last_seen) > max_silence)
            .map(|e| (e.value().last_seen, e.key().clone()))
            .collect();
        silent.sort();
        silent.into_iter().map(|(_, id)| id).collect()
    }

    /// Re-publish directory entries for every live connection
    pub async fn republish_all(&self) -> usize {
        let live: Vec<(DeviceId, ConnectionId)> = self
            .by_device
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let count = live.len();
        for (device_id, connection_id) in live {
            self.publish(&device_id, &connection_id).await;
        }
        count
    }

    async fn publish(&self, device_id: &DeviceId, connection_id: &ConnectionId) {
        let entry = DirectoryEntry::new(
            device_id.clone(),
            self.node_id.clone(),
            connection_id.clone(),
        );
        match timeout(
            self.options.directory_timeout,
            self.directory.publish(&entry, self.options.directory_ttl),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(device_id = %device_id, error = %e, "Failed to publish directory entry");
            }
            Err(_) => {
                warn!(device_id = %device_id, "Directory publish timed out");
            }
        }
    }
}
