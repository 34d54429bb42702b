//! Operator-defined entity groups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A named set of entities the operator can manage together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters, derive_new::new)]
pub struct EntityGroup {
    /// Group identifier (`grp_...`)
    #[new(into)]
    id: String,
    /// Display name
    #[new(into)]
    name: String,
    /// Member entities
    entities: BTreeSet<String>,
    /// Optional icon hint for UIs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

impl EntityGroup {
    /// Rename in place.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Replace the member set.
    pub fn set_entities(&mut self, entities: BTreeSet<String>) {
        self.entities = entities;
    }

    /// Replace the icon.
    pub fn set_icon(&mut self, icon: Option<String>) {
        self.icon = icon;
    }
}
