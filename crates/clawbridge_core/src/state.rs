//! Entity state and upstream event types.

use crate::EntityPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upstream representation of one entity's state.
///
/// Unknown fields are kept in `extra` so that responses pass through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct EntityState {
    /// Entity identifier (`domain.object_id`)
    entity_id: String,
    /// Current state string
    state: String,
    /// Attribute map
    #[serde(default)]
    attributes: Map<String, Value>,
    /// Last state change, as reported upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_changed: Option<String>,
    /// Last update, as reported upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<String>,
    /// Fields not modelled above
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl EntityState {
    /// Build a state with no timestamps.
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes,
            last_changed: None,
            last_updated: None,
            extra: Map::new(),
        }
    }

    /// Attach the exposure policy under `clawbridge_*` attributes.
    ///
    /// Adds `clawbridge_access_level`, plus `clawbridge_annotation` and
    /// `clawbridge_constraints` when the policy carries them.
    pub fn with_policy(mut self, policy: &EntityPolicy) -> Self {
        self.attributes.insert(
            "clawbridge_access_level".to_string(),
            Value::String(policy.access_level().to_string()),
        );
        if let Some(annotation) = policy.annotation() {
            self.attributes.insert(
                "clawbridge_annotation".to_string(),
                Value::String(annotation.clone()),
            );
        }
        if !policy.constraints().is_empty() {
            if let Ok(constraints) = serde_json::to_value(policy.constraints()) {
                self.attributes
                    .insert("clawbridge_constraints".to_string(), constraints);
            }
        }
        self
    }

    /// Friendly name attribute, falling back to the entity id.
    pub fn friendly_name(&self) -> &str {
        self.attributes
            .get("friendly_name")
            .and_then(Value::as_str)
            .unwrap_or(&self.entity_id)
    }

    /// Whether the platform reports the entity as unavailable or unknown.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.state.as_str(), "unavailable" | "unknown")
    }
}

/// A state transition for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters, derive_new::new)]
pub struct StateChange {
    /// Entity identifier
    #[new(into)]
    entity_id: String,
    /// Previous state, absent when the entity appeared
    old_state: Option<EntityState>,
    /// New state, absent when the entity was removed
    new_state: Option<EntityState>,
}

/// Events delivered by the upstream event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// An entity changed state
    StateChanged(StateChange),
    /// A user pressed an action button on a notification
    NotificationAction {
        /// Action identifier attached to the button
        action: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessLevel, ParamConstraint};
    use serde_json::json;

    #[test]
    fn test_unknown_fields_pass_through() {
        let raw = json!({
            "entity_id": "light.office",
            "state": "on",
            "attributes": {"brightness": 120},
            "last_changed": "2026-10-19T10:00:00+00:00",
            "context": {"id": "abc"}
        });
        let state: EntityState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(state.state(), "on");
        assert_eq!(serde_json::to_value(&state).unwrap(), raw);
    }

    #[test]
    fn test_policy_is_attached() {
        let policy = EntityPolicy::new(AccessLevel::Confirm)
            .with_annotation("Front door".to_string())
            .with_constraint("code", ParamConstraint::new(Some(0.0), Some(9999.0)));
        let state = EntityState::new("lock.front_door", "locked", Map::new()).with_policy(&policy);
        assert_eq!(state.attributes()["clawbridge_annotation"], "Front door");
        assert_eq!(state.attributes()["clawbridge_access_level"], "confirm");
        assert_eq!(state.attributes()["clawbridge_constraints"]["code"]["max"], 9999.0);
        assert_eq!(state.friendly_name(), "lock.front_door");
    }
}
