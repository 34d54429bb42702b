//! Client identities used for scoping, rate limiting and audit attribution.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// The principal a request is attributed to.
///
/// With no API keys configured the identity is the source address alone, with
/// full scope and the global rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
pub struct ClientIdentity {
    /// Authenticating key, if any
    key_id: Option<String>,
    /// Source address of the request
    source_ip: IpAddr,
    /// Entity scope of the key; `None` means every exposed entity
    scope: Option<BTreeSet<String>>,
    /// Per-key request budget; `None` means the global default
    rate_limit_per_minute: Option<u32>,
}

impl ClientIdentity {
    /// Identity bound to an address only.
    pub fn anonymous(source_ip: IpAddr) -> Self {
        Self {
            key_id: None,
            source_ip,
            scope: None,
            rate_limit_per_minute: None,
        }
    }

    /// Identity authenticated by an API key.
    pub fn keyed(
        key_id: impl Into<String>,
        source_ip: IpAddr,
        scope: Option<BTreeSet<String>>,
        rate_limit_per_minute: Option<u32>,
    ) -> Self {
        Self {
            key_id: Some(key_id.into()),
            source_ip,
            scope,
            rate_limit_per_minute,
        }
    }

    /// Whether the identity's key scope admits the entity.
    pub fn in_scope(&self, entity_id: &str) -> bool {
        self.scope
            .as_ref()
            .is_none_or(|scope| scope.contains(entity_id))
    }

    /// Whether this identity carries a key scope.
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// Attribution string for audit records: `key_id@ip` or `ip`.
    pub fn label(&self) -> String {
        match &self.key_id {
            Some(key_id) => format!("{}@{}", key_id, self.source_ip),
            None => self.source_ip.to_string(),
        }
    }
}
