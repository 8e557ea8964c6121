//! Authentication handshake.
//!
//! Right after the socket opens the hub sends `auth_required`; the client
//! answers with its access token and the hub replies `auth_ok` (carrying its
//! version) or `auth_invalid`. Nothing else may be sent before `auth_ok`.

use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::error::{HubError, HubResult};
use crate::protocol::{self, InboundFrame};
use crate::transport::{Transport, WireMessage};

/// Run the handshake on a freshly opened transport.
///
/// Returns the hub version from `auth_ok`.
pub async fn authenticate(transport: &mut Transport, access_token: &str) -> HubResult<String> {
    match next_frame(transport).await? {
        InboundFrame::AuthRequired { ha_version } => {
            debug!(version = ?ha_version, "Hub requested authentication");
        }
        other => {
            return Err(HubError::Protocol(format!(
                "expected auth_required, got {:?}",
                other
            )));
        }
    }

    transport
        .sink
        .send(WireMessage::Text(protocol::auth_frame(access_token)))
        .await?;

    match next_frame(transport).await? {
        InboundFrame::AuthOk { ha_version } => Ok(ha_version.unwrap_or_default()),
        InboundFrame::AuthInvalid { message } => {
            let message = message.unwrap_or_else(|| "invalid access token".to_string());
            warn!(message = %message, "Hub rejected access token");
            Err(HubError::Auth(message))
        }
        other => Err(HubError::Protocol(format!(
            "expected auth_ok or auth_invalid, got {:?}",
            other
        ))),
    }
}

/// Next decoded frame, skipping transport-level pings and pongs.
async fn next_frame(transport: &mut Transport) -> HubResult<InboundFrame> {
    loop {
        match transport.stream.next().await {
            Some(Ok(WireMessage::Text(text))) => {
                return protocol::decode(&text)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| HubError::Protocol("empty frame batch".into()));
            }
            Some(Ok(WireMessage::Ping(_))) | Some(Ok(WireMessage::Pong(_))) => continue,
            Some(Ok(WireMessage::Close(info))) => {
                let reason = info.map(|i| i.reason).unwrap_or_default();
                return Err(HubError::Connection(format!(
                    "socket closed during authentication: {}",
                    reason
                )));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(HubError::Connection(
                    "socket closed during authentication".into(),
                ));
            }
        }
    }
}
