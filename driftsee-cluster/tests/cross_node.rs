//! Commands routed between gateway nodes sharing a directory

use chrono::Utc;
use driftsee_cluster::{
    CommandRelay, ConnectionHandle, ControlError, DeviceAddress, DeviceDirectory, DirectoryEntry,
    Gateway, InProcessRelay, LocalDeviceDirectory, Outbound, Transport,
};
use driftsee_core::models::{events, ConnectionId, DeviceId, DeviceSn, Envelope, PlayId, RoomId};
use driftsee_core::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Cluster {
    directory: Arc<LocalDeviceDirectory>,
    relay: Arc<InProcessRelay>,
    a: Arc<Gateway>,
    b: Arc<Gateway>,
}

fn cluster() -> Cluster {
    let config = Config::default();
    let directory = Arc::new(LocalDeviceDirectory::new());
    let relay = Arc::new(InProcessRelay::new());
    let shared: Arc<dyn CommandRelay> = relay.clone();

    let a = Arc::new(Gateway::from_config(
        "node-a",
        &config,
        directory.clone(),
        Some(shared.clone()),
    ));
    let b = Arc::new(Gateway::from_config(
        "node-b",
        &config,
        directory.clone(),
        Some(shared),
    ));
    Cluster {
        directory,
        relay,
        a,
        b,
    }
}

async fn connect(gw: &Gateway, device: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
    let (transport, rx) = Transport::channel(16);
    let handle = gw
        .connect(
            transport,
            DeviceAddress {
                room_id: RoomId::from("R1"),
                device_sn: DeviceSn::from("SN"),
                device_id: DeviceId::from(device),
                language: "zh-CN".to_string(),
            },
        )
        .await;
    (handle, rx)
}

#[tokio::test]
async fn command_reaches_device_on_another_node() {
    let cluster = cluster();
    let (handle, mut rx) = connect(&cluster.b, "D1").await;

    let origin = cluster.a.clone();
    let call = tokio::spawn(async move {
        origin
            .submit_control(
                &DeviceId::from("D1"),
                Envelope::control(events::STOP_RTMP).with_play_id(PlayId::from("P1")),
                None,
            )
            .await
    });

    let sent = match rx.recv().await {
        Some(Outbound::Frame(env)) => env,
        other => panic!("expected frame, got {other:?}"),
    };
    assert_eq!(sent.event, events::STOP_RTMP);

    cluster
        .b
        .on_raw_frame(
            &handle.connection_id,
            r#"{"type":"control","event":"stop_rtmp","playId":"P1","code":0}"#,
        )
        .await;

    let ack = call.await.unwrap().unwrap();
    assert_eq!(ack.play_id, Some(PlayId::from("P1")));
    assert_eq!(cluster.a.correlator().pending_count(), 0);
    assert_eq!(cluster.b.correlator().pending_count(), 0);
}

#[tokio::test]
async fn dead_owner_node_means_offline() {
    let cluster = cluster();
    let (_handle, _rx) = connect(&cluster.b, "D1").await;
    cluster.relay.detach("node-b");

    let result = cluster
        .a
        .submit_control(&DeviceId::from("D1"), Envelope::control(events::START_RTMP), None)
        .await;
    assert_eq!(result, Err(ControlError::Offline(DeviceId::from("D1"))));
}

#[tokio::test]
async fn stale_directory_entry_is_not_trusted() {
    let cluster = cluster();
    let mut entry = DirectoryEntry::new(
        DeviceId::from("D1"),
        "node-b".to_string(),
        ConnectionId::new(),
    );
    entry.published_at = Utc::now() - chrono::Duration::seconds(600);
    cluster
        .directory
        .publish(&entry, Duration::from_secs(900))
        .await
        .unwrap();

    let result = cluster
        .a
        .submit_control(&DeviceId::from("D1"), Envelope::control(events::START_RTMP), None)
        .await;
    assert_eq!(result, Err(ControlError::Offline(DeviceId::from("D1"))));
}

#[tokio::test]
async fn entry_naming_the_asking_node_is_not_followed() {
    let cluster = cluster();
    let (handle, _rx) = connect(&cluster.a, "D1").await;

    // Simulate a directory entry left over after a silent local disconnect
    cluster
        .a
        .registry()
        .evict(&handle.connection_id, "gone", driftsee_core::models::CloseCode::Normal)
        .await;
    let leftover = DirectoryEntry::new(DeviceId::from("D1"), "node-a".to_string(), handle.connection_id);
    cluster
        .directory
        .publish(&leftover, Duration::from_secs(90))
        .await
        .unwrap();

    let result = cluster
        .a
        .submit_control(&DeviceId::from("D1"), Envelope::control(events::START_RTMP), None)
        .await;
    assert_eq!(result, Err(ControlError::Offline(DeviceId::from("D1"))));
}

#[tokio::test]
async fn remote_device_leaving_mid_command_reports_connection_lost() {
    let cluster = cluster();
    let (handle, mut rx) = connect(&cluster.b, "D1").await;

    let origin = cluster.a.clone();
    let call = tokio::spawn(async move {
        origin
            .submit_control(
                &DeviceId::from("D1"),
                Envelope::control(events::START_RTMP),
                Some(Duration::from_secs(30)),
            )
            .await
    });
    assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));

    cluster
        .b
        .disconnect(&handle.connection_id, "socket closed", driftsee_core::models::CloseCode::Normal)
        .await;

    assert_eq!(
        call.await.unwrap(),
        Err(ControlError::ConnectionLost(DeviceId::from("D1")))
    );
    assert!(cluster
        .directory
        .lookup(&DeviceId::from("D1"))
        .await
        .unwrap()
        .is_none());
}
