//! Control command correlation
//!
//! A command sent to a device is parked in the pending table under
//! `(device_id, playId)` until the device answers with the same `playId`,
//! the deadline passes or the connection goes away. All three paths race to
//! remove the entry; whichever removes it decides the outcome.
//!
//! Commands for one device run strictly one at a time. Later commands wait
//! in FIFO order on the device's lane, and the wait counts against their own
//! deadline.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use driftsee_core::models::{ConnectionId, DeviceId, Envelope, MessageType, PlayId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::error::{ControlError, ControlResult};
use crate::directory::DeviceDirectory;
use crate::registry::ConnectionRegistry;
use crate::relay::{CommandRelay, ForwardTarget};

type PendingKey = (DeviceId, PlayId);

struct PendingControl {
    connection_id: ConnectionId,
    event: String,
    submitted_at: Instant,
    tx: oneshot::Sender<Envelope>,
}

/// Serializes commands for one device
#[derive(Default)]
struct DeviceLane {
    turn: Mutex<()>,
    /// In-flight plus queued commands. Only changed under the lane map's shard lock.
    depth: AtomicUsize,
}

/// Holds a place on a device lane until dropped
struct LaneTicket<'a> {
    lanes: &'a DashMap<DeviceId, Arc<DeviceLane>>,
    device_id: DeviceId,
    lane: Arc<DeviceLane>,
}

impl Drop for LaneTicket<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(entry) = self.lanes.entry(self.device_id.clone()) {
            if entry.get().depth.fetch_sub(1, Ordering::AcqRel) == 1 {
                entry.remove();
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelatorOptions {
    /// Used when the caller does not ask for a timeout
    pub default_timeout: Duration,
    /// Caller-requested timeouts are clamped to this
    pub max_timeout: Duration,
    /// Commands allowed to queue behind the one in flight
    pub max_queued_commands: usize,
    /// Budget for one directory lookup
    pub directory_timeout: Duration,
    /// Directory entries older than this are not trusted for routing
    pub stale_after: Duration,
}

impl Default for CorrelatorOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(60),
            max_queued_commands: 8,
            directory_timeout: Duration::from_secs(2),
            stale_after: Duration::from_secs(180),
        }
    }
}

pub struct ControlCorrelator {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn DeviceDirectory>,
    relay: Option<Arc<dyn CommandRelay>>,
    pending: DashMap<PendingKey, PendingControl>,
    lanes: DashMap<DeviceId, Arc<DeviceLane>>,
    options: CorrelatorOptions,
}

impl ControlCorrelator {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn DeviceDirectory>,
        relay: Option<Arc<dyn CommandRelay>>,
        options: CorrelatorOptions,
    ) -> Self {
        Self {
            registry,
            directory,
            relay,
            pending: DashMap::new(),
            lanes: DashMap::new(),
            options,
        }
    }

    /// Number of commands currently waiting for an acknowledgement
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Devices with at least one command in flight or queued
    #[must_use]
    pub fn busy_devices(&self) -> usize {
        self.lanes.len()
    }

    /// Stamp routing fields and make sure the command carries a `playId`
    fn prepare(device_id: &DeviceId, mut envelope: Envelope) -> (PlayId, Envelope) {
        let play_id = envelope.play_id.take().unwrap_or_default();
        envelope.kind = MessageType::Control;
        envelope.device_id = Some(device_id.clone());
        envelope.play_id = Some(play_id.clone());
        (play_id, envelope)
    }

    fn budget(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.options.default_timeout)
            .min(self.options.max_timeout)
    }

    /// Send a command to `device_id` wherever it is connected and wait for
    /// its acknowledgement
    pub async fn dispatch(
        &self,
        device_id: &DeviceId,
        envelope: Envelope,
        requested_timeout: Option<Duration>,
    ) -> ControlResult {
        let budget = self.budget(requested_timeout);
        let deadline = Instant::now() + budget;
        let (play_id, envelope) = Self::prepare(device_id, envelope);

        if self.registry.get_by_device(device_id).is_some() {
            return self
                .dispatch_local(device_id, play_id, envelope, deadline, budget)
                .await;
        }

        self.dispatch_remote(device_id, envelope, deadline, budget).await
    }

    async fn dispatch_remote(
        &self,
        device_id: &DeviceId,
        envelope: Envelope,
        deadline: Instant,
        budget: Duration,
    ) -> ControlResult {
        let offline = || Err(ControlError::Offline(device_id.clone()));

        let entry = match timeout(self.options.directory_timeout, self.directory.lookup(device_id)).await {
            Ok(Ok(Some(entry))) => entry,
            Ok(Ok(None)) => return offline(),
            Ok(Err(e)) => {
                warn!(device_id = %device_id, error = %e, "Directory lookup failed");
                return offline();
            }
            Err(_) => {
                warn!(device_id = %device_id, "Directory lookup timed out");
                return offline();
            }
        };

        if entry.node_id == self.registry.node_id() {
            debug!(device_id = %device_id, "Directory names this node but the device is not connected");
            return offline();
        }
        if entry.is_stale(self.options.stale_after) {
            debug!(device_id = %device_id, node_id = %entry.node_id, "Ignoring stale directory entry");
            return offline();
        }
        let Some(relay) = &self.relay else {
            debug!(device_id = %device_id, node_id = %entry.node_id, "No relay configured for remote owner");
            return offline();
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        debug!(device_id = %device_id, node_id = %entry.node_id, "Forwarding command to owner node");
        match timeout_at(deadline, relay.forward(&entry, envelope, remaining)).await {
            Ok(result) => result,
            Err(_) => Err(Self::timeout_error(budget)),
        }
    }

    async fn dispatch_local(
        &self,
        device_id: &DeviceId,
        play_id: PlayId,
        envelope: Envelope,
        deadline: Instant,
        budget: Duration,
    ) -> ControlResult {
        let key = (device_id.clone(), play_id.clone());

        if self.pending.contains_key(&key) {
            return Err(ControlError::DuplicateCorrelation(play_id));
        }

        let ticket = self.enter_lane(device_id)?;
        let Ok(_turn) = timeout_at(deadline, ticket.lane.turn.lock()).await else {
            debug!(device_id = %device_id, play_id = %play_id, "Command expired while queued");
            return Err(Self::timeout_error(budget));
        };

        // The device may have gone away while this command was queued
        let Some(handle) = self.registry.get_by_device(device_id) else {
            return Err(ControlError::Offline(device_id.clone()));
        };

        let (tx, mut rx) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => return Err(ControlError::DuplicateCorrelation(play_id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingControl {
                    connection_id: handle.connection_id.clone(),
                    event: envelope.event.clone(),
                    submitted_at: Instant::now(),
                    tx,
                });
            }
        }

        debug!(
            device_id = %device_id,
            play_id = %play_id,
            connection_id = %handle.connection_id,
            event = %envelope.event,
            "Control command sent"
        );

        if let Err(e) = self.registry.send(&handle.connection_id, envelope).await {
            self.pending.remove(&key);
            return Err(ControlError::Transport(e.to_string()));
        }

        let failure = tokio::select! {
            biased;
            ack = &mut rx => {
                return ack.map_err(|_| ControlError::ConnectionLost(device_id.clone()));
            }
            () = handle.closed.cancelled() => ControlError::ConnectionLost(device_id.clone()),
            () = sleep_until(deadline) => Self::timeout_error(budget),
        };

        // Lost the race to an acknowledgement that is already on its way
        if self.pending.remove(&key).is_none() {
            return rx
                .await
                .map_err(|_| ControlError::ConnectionLost(device_id.clone()));
        }

        info!(
            device_id = %device_id,
            play_id = %play_id,
            reason = failure.kind(),
            "Control command failed"
        );
        Err(failure)
    }

    fn enter_lane(&self, device_id: &DeviceId) -> Result<LaneTicket<'_>, ControlError> {
        let lane = {
            let entry = self.lanes.entry(device_id.clone()).or_default();
            let depth = entry.depth.load(Ordering::Acquire);
            if depth > self.options.max_queued_commands {
                debug!(device_id = %device_id, depth, "Command queue full");
                return Err(ControlError::Busy(device_id.clone()));
            }
            entry.depth.fetch_add(1, Ordering::AcqRel);
            Arc::clone(entry.value())
        };

        Ok(LaneTicket {
            lanes: &self.lanes,
            device_id: device_id.clone(),
            lane,
        })
    }

    /// Deliver a device acknowledgement to the command waiting for it.
    /// Returns false for late, duplicate or unsolicited acknowledgements.
    pub fn resolve(&self, device_id: &DeviceId, play_id: &PlayId, ack: Envelope) -> bool {
        let key = (device_id.clone(), play_id.clone());
        let Some((_, pending)) = self.pending.remove(&key) else {
            debug!(device_id = %device_id, play_id = %play_id, "Unmatched acknowledgement dropped");
            return false;
        };

        debug!(
            device_id = %device_id,
            play_id = %play_id,
            connection_id = %pending.connection_id,
            event = %pending.event,
            latency = ?pending.submitted_at.elapsed(),
            code = ack.code,
            "Control command acknowledged"
        );
        pending.tx.send(ack).is_ok()
    }

    fn timeout_error(budget: Duration) -> ControlError {
        ControlError::Timeout {
            timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[async_trait]
impl ForwardTarget for ControlCorrelator {
    async fn execute_local(
        &self,
        device_id: &DeviceId,
        envelope: Envelope,
        budget: Duration,
    ) -> ControlResult {
        if self.registry.get_by_device(device_id).is_none() {
            return Err(ControlError::Offline(device_id.clone()));
        }
        let budget = budget.min(self.options.max_timeout);
        let deadline = Instant::now() + budget;
        let (play_id, envelope) = Self::prepare(device_id, envelope);
        self.dispatch_local(device_id, play_id, envelope, deadline, budget)
            .await
    }
}
