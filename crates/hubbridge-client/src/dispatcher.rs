//! Event dispatcher.
//!
//! Turns hub `event` frames into client notifications. State changes are
//! resolved against the cached entity registry, registry invalidations are
//! handed to the fetch debouncer, anything else is dropped.

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::events::ClientEvent;
use crate::protocol::HubEvent;
use crate::registry::{RegistryCache, ResourceKind};

/// What to do with one hub event.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Emit(ClientEvent),
    /// Queue a coalesced refetch of this resource
    Invalidate(ResourceKind),
    Drop,
}

/// Decide what a hub event means, updating the state snapshot on the way.
pub fn dispatch(registry: &mut RegistryCache, event: &HubEvent) -> Dispatch {
    match event.event_type.as_str() {
        "state_changed" => state_changed(registry, &event.data),
        "call_service" => Dispatch::Emit(ClientEvent::ServiceCalled {
            domain: string_field(&event.data, "domain"),
            service: string_field(&event.data, "service"),
        }),
        other => match ResourceKind::invalidated_by(other) {
            Some(kind) => Dispatch::Invalidate(kind),
            None => {
                debug!(event_type = %other, "Ignoring unhandled event type");
                Dispatch::Drop
            }
        },
    }
}

fn state_changed(registry: &mut RegistryCache, data: &JsonValue) -> Dispatch {
    let Some(entity_id) = data.get("entity_id").and_then(JsonValue::as_str) else {
        debug!("state_changed without entity_id");
        return Dispatch::Drop;
    };

    let Some(entry) = registry.entity(entity_id) else {
        debug!(entity_id, "State change for entity not in registry yet");
        return Dispatch::Drop;
    };
    let device_id = entry.device_id.clone();

    let old_state = non_null(data.get("old_state"));
    let new_state = non_null(data.get("new_state"));
    registry.update_state(entity_id, new_state.clone());

    Dispatch::Emit(ClientEvent::StateChanged {
        device_id,
        entity_id: entity_id.to_string(),
        old_state,
        new_state,
    })
}

fn non_null(value: Option<&JsonValue>) -> Option<JsonValue> {
    value.filter(|v| !v.is_null()).cloned()
}

fn string_field(data: &JsonValue, key: &str) -> String {
    data.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}
