//! Connection and authentication handshake.

mod common;

use std::time::Duration;

use common::{quiet_config, settle, Harness, HUB_VERSION};
use hubbridge_client::{ClientEvent, ConnectionState, HubConfig, HubError};
use serde_json::{json, Value};

#[tokio::test(start_paused = true)]
async fn test_connect_resolves_with_hub_version() {
    let mut harness = Harness::new(quiet_config());
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);

    let _socket = harness.connect().await;

    assert_eq!(harness.client.state(), ConnectionState::Ready);
    assert_eq!(harness.client.version().as_deref(), Some(HUB_VERSION));

    let events = harness.drain_events();
    assert_eq!(events[0], ClientEvent::SocketOpened);
    assert_eq!(
        events[1],
        ClientEvent::Connected {
            version: HUB_VERSION.to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_auth_invalid_rejects_connect() {
    let mut harness = Harness::new(quiet_config().with_reconnect(5, 10));
    let client = harness.client.clone();
    let connect = tokio::spawn(async move { client.connect().await });

    let mut socket = harness.next_socket().await;
    socket.send_json(json!({"type": "auth_required", "ha_version": HUB_VERSION}));
    assert_eq!(socket.next_json().await["type"], "auth");
    socket.send_json(json!({
        "type": "auth_invalid",
        "message": "Invalid access token or password"
    }));

    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::Auth(ref msg) if msg == "Invalid access token or password"));
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);

    // Nothing else is written on the rejected socket.
    assert!(socket.next_frame().await.is_none());

    let err = harness
        .client
        .request("get_states", Value::Null, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::NotConnected));

    // A failed connect() is reported to the caller, not retried.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_is_rejected() {
    let mut harness = Harness::new(quiet_config());
    let _socket = harness.connect().await;

    let err = harness.client.connect().await.unwrap_err();
    assert!(matches!(err, HubError::AlreadyConnected));
    assert_eq!(harness.connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_websocket_url_fails_before_opening() {
    let config = HubConfig::new("http://hub.test:8123/api/websocket", "test-token");
    let harness = Harness::new(config);

    let err = harness.client.connect().await.unwrap_err();
    assert!(matches!(err, HubError::Connection(_)));
    assert_eq!(harness.connector.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_hub_times_out_handshake() {
    let mut harness = Harness::new(quiet_config().with_response_timeout(Duration::from_secs(2)));
    let client = harness.client.clone();
    let connect = tokio::spawn(async move { client.connect().await });

    let _socket = harness.next_socket().await;

    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::Timeout { ref kind, .. } if kind == "auth"));
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_refused_socket_reports_error_event() {
    let mut harness = Harness::new(quiet_config());
    harness.connector.refuse(true);

    let err = harness.client.connect().await.unwrap_err();
    assert!(matches!(err, HubError::Connection(_)));
    assert_eq!(harness.client.state(), ConnectionState::Disconnected);

    settle().await;
    assert!(harness
        .drain_events()
        .iter()
        .any(|e| matches!(e, ClientEvent::Error { .. })));

    harness.connector.refuse(false);
    let _socket = harness.connect().await;
    assert!(harness.client.is_ready());
}
