//! Error types for the hub protocol client.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub could not be reached, or the URL is unusable.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Already connected")]
    AlreadyConnected,

    /// The hub rejected the access token.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The operation needs a `Ready` connection.
    #[error("Not connected")]
    NotConnected,

    #[error("Socket is not open")]
    SocketNotOpen,

    #[error("Request {kind} (id {id}) timed out after {}ms", .after.as_millis())]
    Timeout {
        kind: String,
        id: u64,
        after: Duration,
    },

    /// A frame had an unexpected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The hub answered a request with `success: false`.
    #[error("{message}")]
    Remote { code: String, message: String },

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    FatalReconnectExhausted { attempts: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Only retry exhaustion ends the client; everything else is per-call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalReconnectExhausted { .. })
    }

    /// Build a remote error from the `error` object of a `result` frame.
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_server_message() {
        let err = HubError::remote("x", "boom");
        assert_eq!(err.to_string(), "boom");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_only_exhaustion_is_fatal() {
        assert!(HubError::FatalReconnectExhausted { attempts: 3 }.is_fatal());
        assert!(!HubError::NotConnected.is_fatal());
        assert!(!HubError::Auth("bad token".into()).is_fatal());
    }

    #[test]
    fn test_timeout_message() {
        let err = HubError::Timeout {
            kind: "get_states".into(),
            id: 7,
            after: Duration::from_millis(5000),
        };
        assert_eq!(
            err.to_string(),
            "Request get_states (id 7) timed out after 5000ms"
        );
    }
}
