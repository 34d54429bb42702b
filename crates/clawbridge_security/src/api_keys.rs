//! Bearer credential issuance and validation.

use crate::JsonStore;
use crate::ids::prefixed_id;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use clawbridge_core::{ApiKeyRecord, ApiKeySummary, ClientIdentity, Clock};
use clawbridge_error::{ClawbridgeResult, MediationError, MediationErrorKind, MediationResult};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

const MAX_KEY_NAME_CHARS: usize = 100;
const PREVIEW_CHARS: usize = 7;

/// A freshly issued key. The raw secret exists only in this value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct IssuedKey {
    /// Key identifier
    pub key_id: String,
    /// Raw bearer secret, shown once
    pub secret: String,
    /// Stored metadata
    pub summary: ApiKeySummary,
}

fn hash_secret(salt: &[u8], secret: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize().to_vec()
}

/// API key store persisted as `api_keys.json`.
///
/// With no keys configured the gateway runs in open mode: every request is
/// attributed to its source address with full scope.
#[derive(Debug)]
pub struct ApiKeyStore {
    keys: RwLock<Arc<BTreeMap<String, ApiKeyRecord>>>,
    writer: Mutex<()>,
    store: JsonStore,
    clock: Arc<dyn Clock>,
}

impl ApiKeyStore {
    /// Load keys from the store.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the document exists but cannot be read.
    pub fn open(store: JsonStore, clock: Arc<dyn Clock>) -> ClawbridgeResult<Self> {
        let keys: BTreeMap<String, ApiKeyRecord> = store.load()?;
        info!(keys = keys.len(), "API key store loaded");
        Ok(Self {
            keys: RwLock::new(Arc::new(keys)),
            writer: Mutex::new(()),
            store,
            clock,
        })
    }

    /// Whether no keys exist and the gateway is in open mode.
    pub fn is_open_mode(&self) -> bool {
        self.keys.read().is_empty()
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, ApiKeyRecord>) -> T,
    ) -> ClawbridgeResult<T> {
        let _writer = self.writer.lock();
        let mut next = (**self.keys.read()).clone();
        let out = change(&mut next);
        self.store.save(&next)?;
        *self.keys.write() = Arc::new(next);
        Ok(out)
    }

    /// Issue a key. The returned secret is never retrievable again.
    ///
    /// A rate limit of zero means the global default.
    ///
    /// # Errors
    ///
    /// `InvalidPolicy` for an empty name; a storage error when the key cannot be persisted.
    #[instrument(skip(self, scope), fields(scoped = scope.is_some()))]
    pub fn issue(
        &self,
        name: &str,
        scope: Option<BTreeSet<String>>,
        rate_limit_per_minute: Option<u32>,
    ) -> ClawbridgeResult<IssuedKey> {
        let name: String = name.trim().chars().take(MAX_KEY_NAME_CHARS).collect();
        if name.is_empty() {
            return Err(MediationError::new(MediationErrorKind::InvalidPolicy(
                "key name must not be empty".to_string(),
            ))
            .into());
        }

        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let secret = format!("cb_{}", URL_SAFE_NO_PAD.encode(raw));
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let secret_hash = STANDARD.encode(hash_secret(&salt, &secret));
        let preview: String = secret.chars().take(PREVIEW_CHARS).collect();

        let record = self.mutate(|keys| {
            let mut key_id = prefixed_id("cbk_", 8);
            while keys.contains_key(&key_id) {
                key_id = prefixed_id("cbk_", 8);
            }
            let record = ApiKeyRecord::new(
                key_id.clone(),
                name,
                secret_hash,
                STANDARD.encode(salt),
                format!("{}...", preview),
                scope,
                rate_limit_per_minute.filter(|limit| *limit > 0),
                self.clock.now(),
            );
            keys.insert(key_id, record.clone());
            record
        })?;

        info!(key_id = %record.id(), "API key issued");
        Ok(IssuedKey {
            key_id: record.id().clone(),
            secret,
            summary: record.summary(),
        })
    }

    /// Find the key a bearer token belongs to.
    ///
    /// Every stored hash is compared in constant time and the scan never
    /// stops early, so timing reveals neither which key matched nor how much
    /// of a guess was right.
    pub fn validate(&self, token: &str) -> Option<ApiKeyRecord> {
        let keys = self.keys.read().clone();
        let mut found: Option<&ApiKeyRecord> = None;
        for record in keys.values() {
            let (Ok(salt), Ok(stored)) = (STANDARD.decode(record.salt()), STANDARD.decode(record.secret_hash())) else {
                warn!(key_id = %record.id(), "Stored key material is not valid base64");
                continue;
            };
            let candidate = hash_secret(&salt, token);
            if bool::from(candidate.as_slice().ct_eq(stored.as_slice())) {
                found = Some(record);
            }
        }
        found.cloned()
    }

    /// Resolve the identity of a request.
    ///
    /// # Errors
    ///
    /// `Unauthorized` when keys exist and the token is missing or unknown.
    pub fn authenticate(&self, bearer: Option<&str>, source_ip: IpAddr) -> MediationResult<ClientIdentity> {
        if self.is_open_mode() {
            return Ok(ClientIdentity::anonymous(source_ip));
        }
        let Some(token) = bearer.map(str::trim).filter(|t| !t.is_empty()) else {
            debug!(%source_ip, "Missing bearer token");
            return Err(MediationError::new(MediationErrorKind::Unauthorized(
                "missing bearer token".to_string(),
            )));
        };
        match self.validate(token) {
            Some(record) => Ok(ClientIdentity::keyed(
                record.id().clone(),
                source_ip,
                record.entity_scope().clone(),
                *record.rate_limit_per_minute(),
            )),
            None => {
                warn!(%source_ip, "Invalid bearer token");
                Err(MediationError::new(MediationErrorKind::Unauthorized(
                    "invalid bearer token".to_string(),
                )))
            }
        }
    }

    /// Whether an identity resolved earlier would still authenticate: a keyed
    /// identity while its key exists, an anonymous one while no key exists.
    pub fn is_current(&self, identity: &ClientIdentity) -> bool {
        let keys = self.keys.read();
        match identity.key_id() {
            Some(key_id) => keys.contains_key(key_id),
            None => keys.is_empty(),
        }
    }

    /// Delete a key. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the change cannot be persisted.
    #[instrument(skip(self))]
    pub fn revoke(&self, key_id: &str) -> ClawbridgeResult<bool> {
        if !self.keys.read().contains_key(key_id) {
            return Ok(false);
        }
        let removed = self.mutate(|keys| keys.remove(key_id).is_some())?;
        info!(removed, "API key revoked");
        Ok(removed)
    }

    /// Metadata of every key; secrets and hashes are never included.
    pub fn list(&self) -> Vec<ApiKeySummary> {
        self.keys.read().values().map(ApiKeyRecord::summary).collect()
    }
}
