//! Transport layer.
//!
//! Single responsibility: open a socket to the hub and move frames in and
//! out of it. No knowledge of authentication or request correlation.

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::tls;

/// Close code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// A message on the socket, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

/// Send half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<WireMessage, Error = HubError> + Send>>;

/// Receive half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = HubResult<WireMessage>> + Send>>;

/// An open socket, split for concurrent send and receive.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens transports. The client calls this once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, config: &HubConfig) -> HubResult<Transport>;
}

/// Production connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, config: &HubConfig) -> HubResult<Transport> {
        debug!(url = %config.url, "Opening WebSocket");

        let connector = if config.is_secure() {
            Some(tls::connector(&config.tls)?)
        } else {
            None
        };

        let (ws, _) = connect_async_tls_with_config(config.url.as_str(), None, false, connector)
            .await
            .map_err(|e| HubError::Connection(e.to_string()))?;

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(HubError::from)
            .with(|msg: WireMessage| future::ready(Ok::<_, HubError>(to_tungstenite(msg))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(msg) => from_tungstenite(msg).map(Ok),
                Err(e) => Some(Err(HubError::from(e))),
            })
        });

        debug!(url = %config.url, "WebSocket connected");
        Ok(Transport::new(Box::pin(sink), Box::pin(stream)))
    }
}

fn to_tungstenite(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Ping(data) => Message::Ping(data),
        WireMessage::Pong(data) => Message::Pong(data),
        WireMessage::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

/// Binary and raw frames carry nothing for this protocol.
fn from_tungstenite(msg: Message) -> Option<WireMessage> {
    match msg {
        Message::Text(text) => Some(WireMessage::Text(text)),
        Message::Ping(data) => Some(WireMessage::Ping(data)),
        Message::Pong(data) => Some(WireMessage::Pong(data)),
        Message::Close(frame) => Some(WireMessage::Close(frame.map(|frame| CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        }))),
        Message::Binary(_) | Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_frame_round_trips_code_and_reason() {
        let msg = to_tungstenite(WireMessage::Close(Some(CloseInfo {
            code: 1000,
            reason: "client closed".into(),
        })));
        assert_eq!(
            from_tungstenite(msg),
            Some(WireMessage::Close(Some(CloseInfo {
                code: 1000,
                reason: "client closed".into(),
            })))
        );
    }

    #[test]
    fn test_binary_frames_are_skipped() {
        assert_eq!(from_tungstenite(Message::Binary(vec![1, 2, 3])), None);
        assert_eq!(
            from_tungstenite(Message::Text("{}".into())),
            Some(WireMessage::Text("{}".into()))
        );
    }

    #[tokio::test]
    async fn test_open_refused_is_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = HubConfig::new(format!("ws://127.0.0.1:{}/api/websocket", port), "token");
        let result = WsConnector.open(&config).await;
        assert!(matches!(result, Err(HubError::Connection(_))));
    }
}
