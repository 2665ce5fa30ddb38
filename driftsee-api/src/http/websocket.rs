//! Device WebSocket endpoint
//!
//! One reader task per socket feeds frames to the gateway in arrival order.
//! Outbound traffic goes through a bounded channel drained by a writer task,
//! so a slow device never stalls the registry. The writer also pings the
//! device; a socket that stays silent past the ping timeout is closed.

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use driftsee_cluster::{ConnectionHandle, DeviceAddress, Gateway, Outbound, Transport};
use driftsee_core::models::{CloseCode, ConnectionId, DeviceId, DeviceSn, RoomId};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::http::AppState;

pub const KEEPALIVE_TIMEOUT_REASON: &str = "keepalive ping timeout";

/// Path segments identifying the device
#[derive(Debug, Deserialize)]
pub struct DevicePath {
    pub room_id: String,
    pub device_sn: String,
    pub device_id: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Protocol-level keepalive timing
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Keepalive {
    /// Longest inbound silence tolerated: one ping period plus the pong grace
    #[must_use]
    pub fn silence_limit(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }
}

/// Upgrade a device connection
///
/// `/api/ws/v1/manyRoom/{room_id}/{device_sn}/device/{device_id}[/{language}]`
pub async fn device_socket_handler(
    State(state): State<AppState>,
    Path(path): Path<DevicePath>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let address = DeviceAddress {
        room_id: RoomId::from(path.room_id),
        device_sn: DeviceSn::from(path.device_sn),
        device_id: DeviceId::from(path.device_id),
        language: path
            .language
            .unwrap_or_else(|| state.config.gateway.default_language.clone()),
    };

    ws.max_message_size(state.config.gateway.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, address))
}

async fn handle_socket(socket: WebSocket, state: AppState, address: DeviceAddress) {
    let gateway = state.gateway.clone();
    let keepalive = Keepalive {
        ping_interval: state.config.gateway.ws_ping_interval(),
        ping_timeout: state.config.gateway.ws_ping_timeout(),
    };
    let (transport, rx) = Transport::channel(state.config.gateway.outbound_buffer);
    let device_id = address.device_id.clone();
    let handle = gateway.connect(transport, address).await;
    let connection_id = handle.connection_id.clone();

    info!(connection_id = %connection_id, device_id = %device_id, "Device socket opened");

    let (sink, stream) = socket.split();

    // Registry -> socket
    let writer = tokio::spawn(write_outbound(
        sink,
        rx,
        keepalive.ping_interval,
        connection_id.clone(),
    ));

    // Socket -> gateway
    read_inbound(stream, &gateway, &handle, keepalive).await;

    if let Err(e) = writer.await {
        error!(connection_id = %connection_id, error = %e, "Socket writer task failed");
    }

    info!(connection_id = %connection_id, device_id = %device_id, "Device socket closed");
}

/// Drain the connection's outbound queue into the socket, pinging on a fixed cadence.
/// Ends after a close frame, a write failure, or once the registry drops the transport.
async fn write_outbound<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    ping_interval: Duration,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let outbound = tokio::select! {
            outbound = rx.recv() => outbound,
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    debug!(connection_id = %connection_id, error = %e, "Ping failed");
                    break;
                }
                continue;
            }
        };

        match outbound {
            Some(Outbound::Frame(envelope)) => {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(connection_id = %connection_id, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!(connection_id = %connection_id, error = %e, "Socket write failed");
                    break;
                }
            }
            Some(Outbound::Close { code, reason }) => {
                let frame = CloseFrame {
                    code: code.as_u16(),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
            None => break,
        }
    }
    let _ = sink.close().await;
}

/// Feed inbound frames to the gateway until the socket or the connection ends
async fn read_inbound<S, E>(
    mut stream: S,
    gateway: &Gateway,
    handle: &ConnectionHandle,
    keepalive: Keepalive,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let connection_id = &handle.connection_id;

    loop {
        // Any inbound message, pongs included, restarts the silence clock
        let next = tokio::select! {
            () = handle.closed.cancelled() => return,
            () = sleep(keepalive.silence_limit()) => {
                warn!(connection_id = %connection_id, "No pong within the keepalive window");
                gateway
                    .disconnect(connection_id, KEEPALIVE_TIMEOUT_REASON, CloseCode::InternalError)
                    .await;
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                gateway.on_raw_frame(connection_id, text.as_str()).await;
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => gateway.on_raw_frame(connection_id, text).await,
                Err(_) => {
                    warn!(connection_id = %connection_id, "Binary frame is not UTF-8");
                    gateway
                        .disconnect(connection_id, "malformed message", CloseCode::InvalidPayload)
                        .await;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                gateway.registry().touch(connection_id);
            }
            Some(Ok(Message::Close(_))) | None => {
                gateway
                    .disconnect(connection_id, "socket closed", CloseCode::Normal)
                    .await;
                return;
            }
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "Socket read failed");
                gateway
                    .disconnect(connection_id, "socket error", CloseCode::InternalError)
                    .await;
                return;
            }
        }
    }
}
