//! Typed notifications emitted by the client.
//!
//! Every lifecycle change, registry snapshot and entity update is published
//! on a broadcast channel. Hosts call [`HubEvents::subscribe`] (usually via
//! `HubClient::events`) and receive each [`ClientEvent`] in emission order.

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::warn;

/// A notification emitted by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Authenticated and ready; carries the hub version
    Connected { version: String },
    /// The session ended, expectedly or not
    Disconnected { reason: String },
    SocketOpened,
    SocketClosed { code: Option<u16>, reason: String },
    Error { message: String },
    /// Reconnect attempts exhausted; the client will not recover on its own
    Fatal { message: String },

    Config { config: JsonValue },
    Services { services: JsonValue },
    Devices { devices: Vec<JsonValue> },
    Entities { entities: Vec<JsonValue> },
    Areas { areas: Vec<JsonValue> },
    Labels { labels: Vec<JsonValue> },
    States { states: Vec<JsonValue> },

    Subscribed { subscription: u64 },
    /// An entity known to the registry changed state
    StateChanged {
        device_id: Option<String>,
        entity_id: String,
        old_state: Option<JsonValue>,
        new_state: Option<JsonValue>,
    },
    ServiceCalled { domain: String, service: String },

    Ping,
    Pong,
}

impl ClientEvent {
    /// Short name used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::SocketOpened => "socket_opened",
            Self::SocketClosed { .. } => "socket_closed",
            Self::Error { .. } => "error",
            Self::Fatal { .. } => "fatal",
            Self::Config { .. } => "config",
            Self::Services { .. } => "services",
            Self::Devices { .. } => "devices",
            Self::Entities { .. } => "entities",
            Self::Areas { .. } => "areas",
            Self::Labels { .. } => "labels",
            Self::States { .. } => "states",
            Self::Subscribed { .. } => "subscribed",
            Self::StateChanged { .. } => "state_changed",
            Self::ServiceCalled { .. } => "service_called",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// Broadcast channel for [`ClientEvent`]s.
#[derive(Clone)]
pub struct HubEvents {
    tx: broadcast::Sender<ClientEvent>,
}

impl HubEvents {
    /// `capacity` bounds how far a slow subscriber may fall behind.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns `true` if at least one subscriber exists.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half handed to hosts.
pub struct EventReceiver {
    rx: broadcast::Receiver<ClientEvent>,
}

impl EventReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once the client has been dropped. A subscriber that
    /// falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without waiting.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
