//! Control API behaviour through the router

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use driftsee_api::{create_router, AppState};
use driftsee_cluster::{
    ConnectionHandle, DeviceAddress, Gateway, LocalDeviceDirectory, Outbound, Transport,
};
use driftsee_core::models::{DeviceId, DeviceSn, RoomId};
use driftsee_core::Config;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

fn app() -> (Router, Arc<Gateway>) {
    let config = Arc::new(Config::default());
    let gateway = Arc::new(Gateway::from_config(
        "node-test",
        &config,
        Arc::new(LocalDeviceDirectory::new()),
        None,
    ));
    let state = AppState::new(gateway.clone(), config, "node-test");
    (create_router(state), gateway)
}

async fn connect(gateway: &Gateway, device: &str, room: &str) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
    let (transport, rx) = Transport::channel(8);
    let handle = gateway
        .connect(
            transport,
            DeviceAddress {
                room_id: RoomId::from(room),
                device_sn: DeviceSn::from("SN1"),
                device_id: DeviceId::from(device),
                language: "zh-CN".to_string(),
            },
        )
        .await;
    (handle, rx)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_control(device: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/control/{device}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_connected_devices() {
    let (router, gateway) = app();
    let (_h, _rx) = connect(&gateway, "D1", "R1").await;

    let response = router
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connected_devices"], 1);
    assert_eq!(body["node_id"], "node-test");
}

#[tokio::test]
async fn device_listing_filters_by_room() {
    let (router, gateway) = app();
    let (_h1, _rx1) = connect(&gateway, "D1", "R1").await;
    let (_h2, _rx2) = connect(&gateway, "D2", "R2").await;

    let response = router
        .oneshot(
            Request::get("/api/devices?room_id=R2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["count"], 1);
    assert_eq!(body["data"][0]["device_id"], "D2");
}

#[tokio::test]
async fn control_for_offline_device_is_404_with_failure_envelope() {
    let (router, _gateway) = app();

    let response = router
        .oneshot(post_control("ghost", r#"{"event":"start_rtmp","playId":"P9"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], -1);
    assert_eq!(body["playId"], "P9");
    assert!(body["error_msg"].as_str().unwrap().contains("offline"));
}

#[tokio::test]
async fn malformed_control_body_is_rejected() {
    let (router, _gateway) = app();

    let response = router
        .clone()
        .oneshot(post_control("D1", "{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(post_control("D1", r#"{"event":"  "}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn control_round_trip_returns_device_ack() {
    let (router, gateway) = app();
    let (handle, mut rx) = connect(&gateway, "D1", "R1").await;

    let call = tokio::spawn(router.oneshot(post_control(
        "D1",
        r#"{"event":"start_rtmp","playId":"P1","data":{"bitrate":2000}}"#,
    )));

    let sent = match rx.recv().await {
        Some(Outbound::Frame(env)) => env,
        other => panic!("expected frame, got {other:?}"),
    };
    assert_eq!(sent.data, json!({"bitrate": 2000}));
    assert_eq!(sent.device_id, Some(DeviceId::from("D1")));

    gateway
        .on_raw_frame(
            &handle.connection_id,
            r#"{"type":"control","event":"start_rtmp","playId":"P1","code":0,"data":{"url":"rtmp://x"}}"#,
        )
        .await;

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["url"], "rtmp://x");
}

#[tokio::test]
async fn device_reported_failure_is_400() {
    let (router, gateway) = app();
    let (handle, mut rx) = connect(&gateway, "D1", "R1").await;

    let call = tokio::spawn(router.oneshot(post_control("D1", r#"{"event":"stop_rtmp","playId":"P2"}"#)));
    assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));

    gateway
        .on_raw_frame(
            &handle.connection_id,
            r#"{"type":"control","event":"stop_rtmp","playId":"P2","code":-1,"error_msg":"not streaming"}"#,
        )
        .await;

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error_msg"], "not streaming");
}
