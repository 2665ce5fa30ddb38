//! Redis pub/sub command relay
//!
//! Every node subscribes to two channels:
//! `{prefix}node:{node_id}:commands` for requests it must execute and
//! `{prefix}node:{node_id}:replies` for answers to requests it forwarded.
//! The owner answers each request with `accepted` as soon as it is decoded,
//! then with `completed` once the device has answered.

use async_trait::async_trait;
use dashmap::DashMap;
use driftsee_core::models::{generate_id, DeviceId, Envelope};
use futures::stream::StreamExt;
use redis::aio::ConnectionManager as RedisConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CommandRelay, ForwardTarget};
use crate::control::{ControlError, ControlResult};
use crate::directory::DirectoryEntry;
use crate::error::{Error, Result};

/// Initial backoff delay for subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForwardRequest {
    request_id: String,
    origin: String,
    device_id: DeviceId,
    envelope: Envelope,
    timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReplyOutcome {
    Accepted,
    Completed(ControlResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForwardReply {
    request_id: String,
    outcome: ReplyOutcome,
}

enum SubscriberExit {
    /// Connection established, then the stream ended
    Disconnected,
    /// Could not connect or subscribe
    ConnectFailed(Error),
}

/// Removes a waiting request when the forwarding call finishes
struct WaitingGuard<'a> {
    waiting: &'a DashMap<String, mpsc::Sender<ReplyOutcome>>,
    request_id: String,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.waiting.remove(&self.request_id);
    }
}

pub struct RedisCommandRelay {
    client: redis::Client,
    publisher: RedisConnectionManager,
    node_id: String,
    key_prefix: String,
    confirm_timeout: Duration,
    op_timeout: Duration,
    waiting: DashMap<String, mpsc::Sender<ReplyOutcome>>,
    target: OnceLock<Weak<dyn ForwardTarget>>,
    cancel_token: CancellationToken,
}

impl RedisCommandRelay {
    pub async fn connect(
        redis_url: &str,
        node_id: String,
        key_prefix: String,
        confirm_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;
        let publisher = timeout(op_timeout, RedisConnectionManager::new(client.clone()))
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))??;

        Ok(Self {
            client,
            publisher,
            node_id,
            key_prefix,
            confirm_timeout,
            op_timeout,
            waiting: DashMap::new(),
            target: OnceLock::new(),
            cancel_token: CancellationToken::new(),
        })
    }

    fn commands_channel(&self, node_id: &str) -> String {
        format!("{}node:{}:commands", self.key_prefix, node_id)
    }

    fn replies_channel(&self, node_id: &str) -> String {
        format!("{}node:{}:replies", self.key_prefix, node_id)
    }

    /// Publish `message` and return the number of subscribers that got it
    async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<i64> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.publisher.clone();
        timeout(
            self.op_timeout,
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<i64>(&mut conn),
        )
        .await
        .map_err(|_| Error::Timeout("Redis PUBLISH timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("Redis PUBLISH failed: {e}")))
    }

    /// Start the subscriber loop
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task completion.
    /// Use `shutdown()` to stop the loop.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let relay = self.clone();
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            let mut backoff_secs = INITIAL_BACKOFF_SECS;
            loop {
                if cancel.is_cancelled() {
                    info!("Command relay subscriber cancelled");
                    return;
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Command relay subscriber cancelled");
                        return;
                    }
                    exit = relay.run_subscriber() => match exit {
                        SubscriberExit::Disconnected => {
                            warn!("Command relay subscription lost, reconnecting");
                            backoff_secs = INITIAL_BACKOFF_SECS;
                        }
                        SubscriberExit::ConnectFailed(e) => {
                            error!(
                                error = %e,
                                backoff_secs = backoff_secs,
                                "Command relay failed to subscribe, retrying after backoff"
                            );
                        }
                    }
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Command relay subscriber cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                }
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
            }
        })
    }

    async fn run_subscriber(self: &Arc<Self>) -> SubscriberExit {
        let mut pubsub = match timeout(self.op_timeout, self.client.get_async_pubsub()).await {
            Ok(Ok(ps)) => ps,
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(
                    "Timed out getting Redis Pub/Sub connection".to_string(),
                ))
            }
        };

        let commands = self.commands_channel(&self.node_id);
        let replies = self.replies_channel(&self.node_id);
        match timeout(
            self.op_timeout,
            pubsub.subscribe(&[commands.as_str(), replies.as_str()]),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return SubscriberExit::ConnectFailed(e.into()),
            Err(_) => {
                return SubscriberExit::ConnectFailed(Error::Timeout(
                    "Timed out subscribing to relay channels".to_string(),
                ))
            }
        }

        info!(commands = %commands, replies = %replies, "Command relay subscribed");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, channel = %channel, "Invalid payload");
                    continue;
                }
            };

            if channel == commands {
                match serde_json::from_str::<ForwardRequest>(&payload) {
                    Ok(request) => {
                        let relay = self.clone();
                        tokio::spawn(async move { relay.serve(request).await });
                    }
                    Err(e) => warn!(error = %e, "Failed to decode forwarded command"),
                }
            } else if channel == replies {
                match serde_json::from_str::<ForwardReply>(&payload) {
                    Ok(reply) => self.deliver(reply),
                    Err(e) => warn!(error = %e, "Failed to decode forward reply"),
                }
            }
        }

        SubscriberExit::Disconnected
    }

    /// Execute a request addressed to this node and report back to its origin
    async fn serve(&self, request: ForwardRequest) {
        let reply_channel = self.replies_channel(&request.origin);
        let accepted = ForwardReply {
            request_id: request.request_id.clone(),
            outcome: ReplyOutcome::Accepted,
        };
        if let Err(e) = self.publish(&reply_channel, &accepted).await {
            warn!(request_id = %request.request_id, error = %e, "Failed to confirm forwarded command");
            return;
        }

        let target = self.target.get().and_then(Weak::upgrade);
        let result = match target {
            Some(target) => {
                target
                    .execute_local(
                        &request.device_id,
                        request.envelope,
                        Duration::from_millis(request.timeout_ms),
                    )
                    .await
            }
            None => Err(ControlError::Offline(request.device_id.clone())),
        };

        debug!(
            request_id = %request.request_id,
            origin = %request.origin,
            device_id = %request.device_id,
            success = result.is_ok(),
            "Forwarded command finished"
        );

        let completed = ForwardReply {
            request_id: request.request_id,
            outcome: ReplyOutcome::Completed(result),
        };
        if let Err(e) = self.publish(&reply_channel, &completed).await {
            warn!(error = %e, "Failed to return forwarded command result");
        }
    }

    fn deliver(&self, reply: ForwardReply) {
        match self.waiting.get(&reply.request_id) {
            Some(tx) => {
                let _ = tx.try_send(reply.outcome);
            }
            None => debug!(request_id = %reply.request_id, "Reply for unknown request dropped"),
        }
    }

    /// Gracefully shut down the subscriber loop
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl CommandRelay for RedisCommandRelay {
    async fn forward(
        &self,
        owner: &DirectoryEntry,
        envelope: Envelope,
        budget: Duration,
    ) -> ControlResult {
        let started = Instant::now();
        let deadline = started + budget;
        let confirm_deadline = deadline.min(started + self.confirm_timeout);
        let device_id = owner.device_id.clone();

        let request_id = generate_id();
        let (tx, mut rx) = mpsc::channel(2);
        self.waiting.insert(request_id.clone(), tx);
        let _guard = WaitingGuard {
            waiting: &self.waiting,
            request_id: request_id.clone(),
        };

        let request = ForwardRequest {
            request_id: request_id.clone(),
            origin: self.node_id.clone(),
            device_id: device_id.clone(),
            envelope,
            timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        };

        match self.publish(&self.commands_channel(&owner.node_id), &request).await {
            Ok(0) => {
                debug!(node_id = %owner.node_id, "Owner node is not listening");
                return Err(ControlError::Offline(device_id));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(node_id = %owner.node_id, error = %e, "Failed to forward command");
                return Err(ControlError::Offline(device_id));
            }
        }

        let mut accepted = false;
        loop {
            let wait_until = if accepted { deadline } else { confirm_deadline };
            match timeout_at(wait_until, rx.recv()).await {
                Ok(Some(ReplyOutcome::Accepted)) => accepted = true,
                Ok(Some(ReplyOutcome::Completed(result))) => return result,
                Ok(None) => return Err(ControlError::Remote("relay stopped".to_string())),
                Err(_) if accepted => {
                    return Err(ControlError::Timeout {
                        timeout_ms: request.timeout_ms,
                    })
                }
                Err(_) => {
                    warn!(
                        node_id = %owner.node_id,
                        request_id = %request_id,
                        "Owner node did not confirm forwarded command"
                    );
                    return Err(ControlError::Offline(device_id));
                }
            }
        }
    }

    fn attach(&self, node_id: &str, target: Weak<dyn ForwardTarget>) {
        if node_id != self.node_id {
            warn!(node_id, own = %self.node_id, "Ignoring attach for another node");
            return;
        }
        if self.target.set(target).is_err() {
            warn!("Command relay target already attached");
        }
    }
}
