//! In-memory hub used by the integration tests.
//!
//! `MockConnector` hands every socket the client opens to the test as a
//! `MockSocket`, which plays the hub side of the conversation.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use hubbridge_client::{
    ClientEvent, CloseInfo, Connector, EventReceiver, HubClient, HubConfig, HubError, HubResult,
    Transport, WireMessage,
};

pub const TEST_URL: &str = "ws://hub.test:8123/api/websocket";
pub const HUB_VERSION: &str = "2024.10.1";

/// Config with keepalive and reconnect turned off; tests opt back in.
pub fn quiet_config() -> HubConfig {
    HubConfig::new(TEST_URL, "test-token")
        .with_keepalive(Duration::ZERO, Duration::ZERO)
        .with_reconnect(0, 0)
}

/// Hub side of one client socket.
pub struct MockSocket {
    to_client: fmpsc::UnboundedSender<HubResult<WireMessage>>,
    from_client: fmpsc::UnboundedReceiver<WireMessage>,
}

impl MockSocket {
    pub fn send_text(&self, text: &str) {
        self.to_client
            .unbounded_send(Ok(WireMessage::Text(text.to_string())))
            .expect("client reader gone");
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub fn send_result(&self, id: u64, result: Value) {
        self.send_json(json!({"id": id, "type": "result", "success": true, "result": result}));
    }

    pub fn send_event(&self, subscription: u64, event_type: &str, data: Value) {
        self.send_json(json!({
            "id": subscription,
            "type": "event",
            "event": {"event_type": event_type, "data": data, "origin": "LOCAL"}
        }));
    }

    pub fn send_transport_pong(&self) {
        let _ = self.to_client.unbounded_send(Ok(WireMessage::Pong(Vec::new())));
    }

    pub fn send_close(&self, code: u16, reason: &str) {
        let _ = self.to_client.unbounded_send(Ok(WireMessage::Close(Some(CloseInfo {
            code,
            reason: reason.to_string(),
        }))));
    }

    /// Next frame the client wrote, `None` once the client dropped the socket.
    pub async fn next_frame(&mut self) -> Option<WireMessage> {
        tokio::time::timeout(Duration::from_secs(600), self.from_client.next())
            .await
            .expect("no frame from client")
    }

    /// Next JSON frame, skipping keepalive traffic.
    pub async fn next_json(&mut self) -> Value {
        loop {
            match self.next_frame().await {
                Some(WireMessage::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).expect("client sent bad JSON");
                    if value["type"] != "ping" {
                        return value;
                    }
                }
                Some(WireMessage::Ping(_)) | Some(WireMessage::Pong(_)) => {}
                Some(other) => panic!("expected a JSON frame, got {:?}", other),
                None => panic!("client closed the socket"),
            }
        }
    }

    /// Play the hub side of the auth handshake.
    pub async fn handshake(&mut self) {
        self.send_json(json!({"type": "auth_required", "ha_version": HUB_VERSION}));
        let auth = self.next_json().await;
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["access_token"], "test-token");
        self.send_json(json!({"type": "auth_ok", "ha_version": HUB_VERSION}));
    }

    /// Answer the next request of the given type with `result`.
    pub async fn answer(&mut self, kind: &str, result: Value) -> u64 {
        let request = self.next_json().await;
        assert_eq!(request["type"], kind);
        let id = request["id"].as_u64().expect("request without id");
        self.send_result(id, result);
        id
    }
}

pub struct MockConnector {
    sockets: mpsc::UnboundedSender<MockSocket>,
    opens: AtomicUsize,
    refuse: AtomicBool,
}

impl MockConnector {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make every following `open` fail with a connection error.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _config: &HubConfig) -> HubResult<Transport> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(HubError::Connection("connection refused".into()));
        }

        let (to_hub, from_client) = fmpsc::unbounded::<WireMessage>();
        let (to_client, from_hub) = fmpsc::unbounded::<HubResult<WireMessage>>();
        let _ = self.sockets.send(MockSocket {
            to_client,
            from_client,
        });

        let sink = to_hub.sink_map_err(|_| HubError::SocketNotOpen);
        Ok(Transport::new(Box::pin(sink), Box::pin(from_hub)))
    }
}

pub struct Harness {
    pub client: HubClient,
    pub connector: Arc<MockConnector>,
    pub events: EventReceiver,
    sockets: mpsc::UnboundedReceiver<MockSocket>,
}

impl Harness {
    pub fn new(config: HubConfig) -> Self {
        let (tx, sockets) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            sockets: tx,
            opens: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        });
        let client = HubClient::with_connector(config, connector.clone());
        let events = client.events();
        Self {
            client,
            connector,
            events,
            sockets,
        }
    }

    /// Wait for the client to open its next socket.
    pub async fn next_socket(&mut self) -> MockSocket {
        tokio::time::timeout(Duration::from_secs(600), self.sockets.recv())
            .await
            .expect("client never opened a socket")
            .expect("connector dropped")
    }

    /// Run `connect()` against a well-behaved hub.
    pub async fn connect(&mut self) -> MockSocket {
        let client = self.client.clone();
        let connect = tokio::spawn(async move { client.connect().await });

        let mut socket = self.next_socket().await;
        socket.handshake().await;

        let version = connect.await.expect("connect task panicked").expect("connect failed");
        assert_eq!(version, HUB_VERSION);
        socket
    }

    /// Accept a socket opened by the reconnect supervisor.
    pub async fn accept(&mut self) -> MockSocket {
        let mut socket = self.next_socket().await;
        socket.handshake().await;
        self.wait_for(|e| matches!(e, ClientEvent::Connected { .. }))
            .await;
        socket
    }

    /// Next event matching `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => {}
                    None => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(600), wait)
            .await
            .expect("event never arrived")
    }

    /// Drain every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
