//! Client for a home-automation hub's WebSocket API.
//!
//! The client authenticates with a long-lived access token, correlates
//! requests with their `result` frames, keeps the socket alive with
//! pings and a watchdog, turns hub events into typed [`ClientEvent`]s and
//! reconnects on its own after an unexpected close.
//!
//! ```no_run
//! use hubbridge_client::{HubClient, HubConfig, ResourceKind};
//!
//! # async fn demo() -> hubbridge_client::HubResult<()> {
//! let client = HubClient::new(HubConfig::new("ws://hub.local:8123/api/websocket", "token"));
//! let mut events = client.events();
//! client.connect().await?;
//! client.subscribe_events(None).await?;
//! client.fetch(ResourceKind::Entities).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", event.type_name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod correlator;
pub mod debouncer;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod tls;
pub mod transport;

pub use client::{ConnectionState, HubClient};
pub use config::{HubConfig, TlsOptions};
pub use error::{HubError, HubResult};
pub use events::{ClientEvent, EventReceiver, HubEvents};
pub use protocol::{HubEvent, InboundFrame, ServiceCall};
pub use registry::{RegistryCounts, ResourceKind};
pub use transport::{CloseInfo, Connector, Transport, WireMessage, WsConnector};
