//! Local cache of the hub's registries.
//!
//! Snapshots fetched from the hub are applied here and turned into the
//! matching [`ClientEvent`]. The event dispatcher reads the entity registry
//! to resolve state changes to devices.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::events::ClientEvent;

/// A hub resource that can be fetched and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Config,
    Services,
    Devices,
    Entities,
    Areas,
    Labels,
    States,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Config,
        ResourceKind::Services,
        ResourceKind::Devices,
        ResourceKind::Entities,
        ResourceKind::Areas,
        ResourceKind::Labels,
        ResourceKind::States,
    ];

    /// Request type used to fetch this resource.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Config => "get_config",
            Self::Services => "get_services",
            Self::Devices => "config/device_registry/list",
            Self::Entities => "config/entity_registry/list",
            Self::Areas => "config/area_registry/list",
            Self::Labels => "config/label_registry/list",
            Self::States => "get_states",
        }
    }

    /// Resource invalidated by a hub event type, if any.
    pub fn invalidated_by(event_type: &str) -> Option<Self> {
        match event_type {
            "core_config_updated" => Some(Self::Config),
            "service_registered" | "service_removed" => Some(Self::Services),
            "device_registry_updated" => Some(Self::Devices),
            "entity_registry_updated" => Some(Self::Entities),
            "area_registry_updated" => Some(Self::Areas),
            "label_registry_updated" => Some(Self::Labels),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Services => "services",
            Self::Devices => "devices",
            Self::Entities => "entities",
            Self::Areas => "areas",
            Self::Labels => "labels",
            Self::States => "states",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// An entity registry entry, reduced to what the dispatcher needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityEntry {
    pub entity_id: String,
    pub device_id: Option<String>,
}

/// Number of cached entries per resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub devices: usize,
    pub entities: usize,
    pub areas: usize,
    pub labels: usize,
    pub states: usize,
}

/// Cached registry snapshots.
#[derive(Debug, Default)]
pub struct RegistryCache {
    config: Option<JsonValue>,
    devices: Vec<JsonValue>,
    entities: HashMap<String, EntityEntry>,
    areas: Vec<JsonValue>,
    labels: Vec<JsonValue>,
    states: HashMap<String, JsonValue>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fetched snapshot and return the event announcing it.
    pub fn apply(&mut self, kind: ResourceKind, value: JsonValue) -> ClientEvent {
        match kind {
            ResourceKind::Config => {
                self.config = Some(value.clone());
                ClientEvent::Config { config: value }
            }
            ResourceKind::Services => ClientEvent::Services { services: value },
            ResourceKind::Devices => {
                self.devices = as_list(kind, value);
                ClientEvent::Devices {
                    devices: self.devices.clone(),
                }
            }
            ResourceKind::Entities => {
                let entities = as_list(kind, value);
                self.entities = entities
                    .iter()
                    .filter_map(|entry| {
                        let entity_id = entry.get("entity_id")?.as_str()?.to_string();
                        let device_id = entry
                            .get("device_id")
                            .and_then(JsonValue::as_str)
                            .map(String::from);
                        Some((
                            entity_id.clone(),
                            EntityEntry {
                                entity_id,
                                device_id,
                            },
                        ))
                    })
                    .collect();
                ClientEvent::Entities { entities }
            }
            ResourceKind::Areas => {
                self.areas = as_list(kind, value);
                ClientEvent::Areas {
                    areas: self.areas.clone(),
                }
            }
            ResourceKind::Labels => {
                self.labels = as_list(kind, value);
                ClientEvent::Labels {
                    labels: self.labels.clone(),
                }
            }
            ResourceKind::States => {
                let states = as_list(kind, value);
                self.states = states
                    .iter()
                    .filter_map(|state| {
                        let entity_id = state.get("entity_id")?.as_str()?;
                        Some((entity_id.to_string(), state.clone()))
                    })
                    .collect();
                ClientEvent::States { states }
            }
        }
    }

    pub fn entity(&self, entity_id: &str) -> Option<&EntityEntry> {
        self.entities.get(entity_id)
    }

    pub fn state(&self, entity_id: &str) -> Option<&JsonValue> {
        self.states.get(entity_id)
    }

    /// Replace the current-state snapshot of one entity. `None` removes it.
    pub fn update_state(&mut self, entity_id: &str, new_state: Option<JsonValue>) {
        match new_state {
            Some(state) => {
                self.states.insert(entity_id.to_string(), state);
            }
            None => {
                self.states.remove(entity_id);
            }
        }
    }

    pub fn config(&self) -> Option<&JsonValue> {
        self.config.as_ref()
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            devices: self.devices.len(),
            entities: self.entities.len(),
            areas: self.areas.len(),
            labels: self.labels.len(),
            states: self.states.len(),
        }
    }
}

fn as_list(kind: ResourceKind, value: JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items,
        JsonValue::Null => Vec::new(),
        other => {
            warn!(kind = %kind, "Expected a list, got {}", other);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invalidation_mapping() {
        assert_eq!(
            ResourceKind::invalidated_by("device_registry_updated"),
            Some(ResourceKind::Devices)
        );
        assert_eq!(
            ResourceKind::invalidated_by("core_config_updated"),
            Some(ResourceKind::Config)
        );
        assert_eq!(ResourceKind::invalidated_by("state_changed"), None);
    }

    #[test]
    fn test_kind_parses_from_name() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("widgets".parse::<ResourceKind>().is_err());
        assert_eq!(ResourceKind::Entities.command(), "config/entity_registry/list");
    }

    #[test]
    fn test_entities_snapshot_indexes_device_ids() {
        let mut cache = RegistryCache::new();
        let event = cache.apply(
            ResourceKind::Entities,
            json!([
                {"entity_id": "light.kitchen", "device_id": "dev1"},
                {"entity_id": "sun.sun", "device_id": null},
                {"no_entity_id": true}
            ]),
        );

        assert!(matches!(event, ClientEvent::Entities { ref entities } if entities.len() == 3));
        assert_eq!(
            cache.entity("light.kitchen").unwrap().device_id.as_deref(),
            Some("dev1")
        );
        assert_eq!(cache.entity("sun.sun").unwrap().device_id, None);
        assert_eq!(cache.counts().entities, 2);
    }

    #[test]
    fn test_states_snapshot_and_update() {
        let mut cache = RegistryCache::new();
        cache.apply(
            ResourceKind::States,
            json!([{"entity_id": "light.kitchen", "state": "off"}]),
        );
        assert_eq!(cache.state("light.kitchen").unwrap()["state"], "off");

        cache.update_state("light.kitchen", Some(json!({"state": "on"})));
        assert_eq!(cache.state("light.kitchen").unwrap()["state"], "on");

        cache.update_state("light.kitchen", None);
        assert!(cache.state("light.kitchen").is_none());
    }

    #[test]
    fn test_non_list_snapshot_is_treated_as_empty() {
        let mut cache = RegistryCache::new();
        let event = cache.apply(ResourceKind::Devices, json!({"oops": 1}));
        assert_eq!(event, ClientEvent::Devices { devices: vec![] });
    }
}
