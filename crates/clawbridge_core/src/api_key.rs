//! Stored API key records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Persisted API key. The raw secret is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters, derive_new::new)]
pub struct ApiKeyRecord {
    /// Key identifier (`cbk_...`)
    id: String,
    /// Display name
    name: String,
    /// Base64 SHA-256 of `salt || secret`
    secret_hash: String,
    /// Base64 salt
    salt: String,
    /// First characters of the secret, for operator display
    key_preview: String,
    /// Entity scope; `None` means every exposed entity
    entity_scope: Option<BTreeSet<String>>,
    /// Per-key budget; `None` means the global default
    rate_limit_per_minute: Option<u32>,
    /// Creation time
    created_at: DateTime<Utc>,
}

impl ApiKeyRecord {
    /// Metadata safe to list on the operator surface.
    pub fn summary(&self) -> ApiKeySummary {
        ApiKeySummary {
            key_id: self.id.clone(),
            name: self.name.clone(),
            key_preview: self.key_preview.clone(),
            entity_count: self.entity_scope.as_ref().map(BTreeSet::len),
            rate_limit_per_minute: self.rate_limit_per_minute,
            created_at: self.created_at,
        }
    }
}

/// Listing view of an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeySummary {
    /// Key identifier
    pub key_id: String,
    /// Display name
    pub name: String,
    /// Masked secret preview
    pub key_preview: String,
    /// Number of scoped entities, `None` when unscoped
    pub entity_count: Option<usize>,
    /// Per-key budget
    pub rate_limit_per_minute: Option<u32>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
