//! Sensor summaries for agents that poll instead of querying entity by entity.

use chrono::{DateTime, Utc};
use clawbridge_core::EntityState;
use serde::Serialize;
use serde_json::{Map, Value};

/// Attributes copied into a full summary entry when the entity carries them.
pub const SUMMARY_ATTRIBUTES: [&str; 5] =
    ["battery_level", "temperature", "humidity", "brightness", "color_temp"];

/// One entity in a [`SensorSummary`].
///
/// Compact entries carry only `entity_id` and `state`.
#[derive(Debug, Clone, PartialEq, Serialize, derive_getters::Getters)]
pub struct SensorEntry {
    /// Entity identifier
    entity_id: String,
    /// Current state string
    state: String,
    /// Display name, the entity id when the platform has none
    #[serde(skip_serializing_if = "Option::is_none")]
    friendly_name: Option<String>,
    /// State held before the latest change, the current state when none was seen
    #[serde(skip_serializing_if = "Option::is_none")]
    last_state: Option<String>,
    /// Last change as reported upstream, the summary time when unreported
    #[serde(skip_serializing_if = "Option::is_none")]
    last_changed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<Value>,
    /// The [`SUMMARY_ATTRIBUTES`] the entity carries
    #[serde(skip_serializing_if = "Option::is_none")]
    attributes: Option<Map<String, Value>>,
}

impl SensorEntry {
    /// Entity id and state only.
    pub fn compact(state: &EntityState) -> Self {
        Self {
            entity_id: state.entity_id().clone(),
            state: state.state().clone(),
            friendly_name: None,
            last_state: None,
            last_changed: None,
            unit_of_measurement: None,
            device_class: None,
            attributes: None,
        }
    }

    /// Full entry with name, previous state, unit, class and selected attributes.
    pub fn full(state: &EntityState, last_state: Option<&str>, now: DateTime<Utc>) -> Self {
        let attrs = state.attributes();
        let picked: Map<String, Value> = SUMMARY_ATTRIBUTES
            .iter()
            .filter_map(|key| attrs.get(*key).map(|value| (key.to_string(), value.clone())))
            .collect();
        Self {
            entity_id: state.entity_id().clone(),
            state: state.state().clone(),
            friendly_name: Some(state.friendly_name().to_string()),
            last_state: Some(last_state.unwrap_or(state.state()).to_string()),
            last_changed: Some(state.last_changed().clone().unwrap_or_else(|| now.to_rfc3339())),
            unit_of_measurement: attrs.get("unit_of_measurement").cloned(),
            device_class: attrs.get("device_class").cloned(),
            attributes: (!picked.is_empty()).then_some(picked),
        }
    }
}

/// Every visible entity at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, derive_getters::Getters)]
pub struct SensorSummary {
    sensors: Vec<SensorEntry>,
    last_updated: DateTime<Utc>,
    total_sensors: usize,
}

impl SensorSummary {
    /// Wrap entries taken at `now`.
    pub fn new(sensors: Vec<SensorEntry>, now: DateTime<Utc>) -> Self {
        let total_sensors = sensors.len();
        Self {
            sensors,
            last_updated: now,
            total_sensors,
        }
    }
}
