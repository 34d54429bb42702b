//! Access levels and per-domain lookup tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-entity trust tier granted to clients.
///
/// Levels are ordered: `Off < Read < Confirm < Control`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccessLevel {
    /// Invisible to clients
    #[default]
    Off,
    /// State may be read; only read-safe services may be invoked
    Read,
    /// Service calls require human approval
    Confirm,
    /// Service calls are forwarded immediately
    Control,
}

impl AccessLevel {
    /// Whether clients can see the entity at all.
    pub fn is_visible(self) -> bool {
        self != AccessLevel::Off
    }

    /// Whether the level permits mutating service calls.
    pub fn can_invoke(self) -> bool {
        matches!(self, AccessLevel::Confirm | AccessLevel::Control)
    }
}

/// Split a domain-qualified entity id (`light.office`) into its domain.
///
/// Returns `None` when the id has no domain or no object part.
///
/// # Examples
///
/// ```
/// use clawbridge_core::entity_domain;
///
/// assert_eq!(entity_domain("light.office"), Some("light"));
/// assert_eq!(entity_domain("office"), None);
/// assert_eq!(entity_domain(".office"), None);
/// ```
pub fn entity_domain(entity_id: &str) -> Option<&str> {
    let (domain, object) = entity_id.split_once('.')?;
    if domain.is_empty() || object.is_empty() {
        return None;
    }
    Some(domain)
}

/// Domain and service lookup tables.
///
/// Kept as data so deployments can tune them and so they can be tested in
/// isolation from the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
pub struct DomainTables {
    /// Domains whose entities may only hold `off` or `read`
    #[serde(default = "default_read_only_domains")]
    read_only: BTreeSet<String>,
    /// `domain.service` pairs that only return data and may be invoked at `read`
    #[serde(default = "default_read_safe_services")]
    read_safe_services: BTreeSet<String>,
}

impl DomainTables {
    /// Create tables from explicit sets.
    pub fn new(read_only: BTreeSet<String>, read_safe_services: BTreeSet<String>) -> Self {
        Self {
            read_only,
            read_safe_services,
        }
    }

    /// Whether the domain is inherently read-only.
    pub fn is_read_only_domain(&self, domain: &str) -> bool {
        self.read_only.contains(domain)
    }

    /// Whether the service is on the read-safe allowlist.
    pub fn is_read_safe(&self, domain: &str, service: &str) -> bool {
        self.read_safe_services
            .contains(&format!("{}.{}", domain, service))
    }

    /// Highest level an entity of this domain may hold.
    pub fn max_level_for(&self, entity_id: &str) -> AccessLevel {
        match entity_domain(entity_id) {
            Some(domain) if self.is_read_only_domain(domain) => AccessLevel::Read,
            _ => AccessLevel::Control,
        }
    }

    /// Read-safe services registered for one domain.
    pub fn read_safe_services_for<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a str> {
        self.read_safe_services.iter().filter_map(move |pair| {
            pair.split_once('.')
                .filter(|(d, _)| *d == domain)
                .map(|(_, service)| service)
        })
    }
}

impl Default for DomainTables {
    fn default() -> Self {
        Self {
            read_only: default_read_only_domains(),
            read_safe_services: default_read_safe_services(),
        }
    }
}

fn default_read_only_domains() -> BTreeSet<String> {
    [
        "sensor",
        "binary_sensor",
        "weather",
        "sun",
        "zone",
        "person",
        "device_tracker",
        "calendar",
        "event",
        "image",
        "camera",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_read_safe_services() -> BTreeSet<String> {
    ["weather.get_forecasts", "calendar.get_events", "todo.get_items"]
        .into_iter()
        .map(String::from)
        .collect()
}
