//! Wire frames exchanged with the hub.
//!
//! Every frame is a JSON object with a `type` field. Outbound frames are
//! built with `serde_json::json!`; inbound frames decode into [`InboundFrame`].

use crate::error::{HubError, HubResult};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue, json};

/// A frame received from the hub.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Pong {
        #[serde(default)]
        id: Option<u64>,
    },
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        result: JsonValue,
        #[serde(default)]
        error: Option<RemoteErrorBody>,
    },
    Event {
        id: u64,
        event: HubEvent,
    },
    #[serde(other)]
    Unknown,
}

/// `error` object of a failed `result` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteErrorBody {
    #[serde(default)]
    pub code: JsonValue,
    #[serde(default)]
    pub message: String,
}

impl RemoteErrorBody {
    /// The hub sends codes as strings, older versions as numbers.
    pub fn code_string(&self) -> String {
        match &self.code {
            JsonValue::String(s) => s.clone(),
            JsonValue::Null => "unknown_error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Payload of an `event` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HubEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub context: JsonValue,
    #[serde(default)]
    pub time_fired: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
}

/// Decode one text frame. The hub may batch several frames into a JSON array.
pub fn decode(text: &str) -> HubResult<Vec<InboundFrame>> {
    if text.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<InboundFrame>>(text)
            .map_err(|e| HubError::Protocol(format!("malformed frame batch: {}", e)))
    } else {
        serde_json::from_str::<InboundFrame>(text)
            .map(|frame| vec![frame])
            .map_err(|e| HubError::Protocol(format!("malformed frame: {}", e)))
    }
}

pub fn auth_frame(access_token: &str) -> String {
    json!({ "type": "auth", "access_token": access_token }).to_string()
}

pub fn ping_frame(id: u64) -> String {
    json!({ "id": id, "type": "ping" }).to_string()
}

/// Build a correlated request frame `{id, type: kind, ...payload}`.
///
/// `payload` must be a JSON object or `null`.
pub fn request_frame(id: u64, kind: &str, payload: JsonValue) -> HubResult<String> {
    let mut body = match payload {
        JsonValue::Object(map) => map,
        JsonValue::Null => Map::new(),
        other => {
            return Err(HubError::Protocol(format!(
                "request payload for {} must be an object, got {}",
                kind, other
            )));
        }
    };
    body.insert("id".into(), json!(id));
    body.insert("type".into(), json!(kind));
    Ok(JsonValue::Object(body).to_string())
}

/// Payload for `subscribe_events`.
pub fn subscribe_payload(event_type: Option<&str>) -> JsonValue {
    match event_type {
        Some(event_type) => json!({ "event_type": event_type }),
        None => json!({}),
    }
}

/// Payload for `unsubscribe_events`.
pub fn unsubscribe_payload(subscription: u64) -> JsonValue {
    json!({ "subscription": subscription })
}

/// A `call_service` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub service_data: JsonValue,
    pub target: Option<JsonValue>,
}

impl ServiceCall {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            service: service.into(),
            service_data: json!({}),
            target: None,
        }
    }

    pub fn with_data(mut self, service_data: JsonValue) -> Self {
        self.service_data = service_data;
        self
    }

    /// Target a single entity.
    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.target = Some(json!({ "entity_id": entity_id.into() }));
        self
    }

    pub fn with_target(mut self, target: JsonValue) -> Self {
        self.target = Some(target);
        self
    }

    pub fn payload(&self) -> JsonValue {
        let mut body = json!({
            "domain": self.domain,
            "service": self.service,
            "service_data": self.service_data,
        });
        if let Some(target) = &self.target {
            body["target"] = target.clone();
        }
        body
    }
}
