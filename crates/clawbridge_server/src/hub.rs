//! State broadcast hub.
//!
//! Every WebSocket client that completed the handshake owns a bounded queue.
//! Upstream state changes are filtered against the registry, the client's key
//! scope and its subscription, then offered to each queue without waiting. A
//! client whose queue is full is disconnected, and so is one whose credential
//! stopped authenticating (its key was revoked, or the first key ended open
//! mode).

use clawbridge_core::{ClientIdentity, StateChange, gateway_metrics};
use clawbridge_security::{ApiKeyStore, ExposureRegistry};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Hub-assigned connection id.
pub type ConnectionId = u64;

#[derive(Debug)]
struct ConnectionHandle {
    identity: ClientIdentity,
    subscription: Option<BTreeSet<String>>,
    sender: mpsc::Sender<Arc<StateChange>>,
}

impl ConnectionHandle {
    fn wants(&self, entity_id: &str) -> bool {
        self.identity.in_scope(entity_id)
            && self
                .subscription
                .as_ref()
                .is_none_or(|entities| entities.contains(entity_id))
    }
}

/// Fan-out of upstream state changes to authenticated connections.
#[derive(Debug)]
pub struct BroadcastHub {
    registry: Arc<ExposureRegistry>,
    keys: Arc<ApiKeyStore>,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    next_id: AtomicU64,
    buffer: usize,
    dropped: AtomicU64,
}

impl BroadcastHub {
    /// Hub with `buffer` queued events per connection.
    pub fn new(registry: Arc<ExposureRegistry>, keys: Arc<ApiKeyStore>, buffer: usize) -> Self {
        Self {
            registry,
            keys,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Add an authenticated connection. It receives every visible entity
    /// until it subscribes to a subset.
    pub fn register(&self, identity: ClientIdentity) -> (ConnectionId, mpsc::Receiver<Arc<StateChange>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);
        debug!(connection = id, identity = %identity.label(), "Connection registered");
        self.connections.write().insert(
            id,
            ConnectionHandle {
                identity,
                subscription: None,
                sender,
            },
        );
        (id, receiver)
    }

    /// Restrict a connection to `entities`, or widen it back with `None`.
    ///
    /// Returns `false` when the connection is gone.
    pub fn subscribe(&self, id: ConnectionId, entities: Option<BTreeSet<String>>) -> bool {
        match self.connections.write().get_mut(&id) {
            Some(handle) => {
                handle.subscription = entities;
                true
            }
            None => false,
        }
    }

    /// Remove a connection.
    pub fn unregister(&self, id: ConnectionId) {
        if self.connections.write().remove(&id).is_some() {
            debug!(connection = id, "Connection unregistered");
        }
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Connections dropped for falling behind since startup.
    pub fn dropped_connections(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Offer a state change to every interested connection.
    ///
    /// States are annotated with the entity's current policy. Returns how many
    /// connections it was queued for.
    #[instrument(skip(self, change), fields(entity_id = %change.entity_id()))]
    pub fn publish(&self, change: &StateChange) -> usize {
        let snapshot = self.registry.snapshot();
        let Some(policy) = snapshot.exposed_policy(change.entity_id()) else {
            return 0;
        };
        let annotated = Arc::new(StateChange::new(
            change.entity_id().clone(),
            change.old_state().clone().map(|s| s.with_policy(policy)),
            change.new_state().clone().map(|s| s.with_policy(policy)),
        ));

        let mut delivered = 0;
        let mut overflowed = Vec::new();
        let mut stale = Vec::new();
        {
            let connections = self.connections.read();
            for (id, handle) in connections.iter() {
                if !self.keys.is_current(&handle.identity) {
                    stale.push(*id);
                    continue;
                }
                if !handle.wants(change.entity_id()) {
                    continue;
                }
                // Full and closed queues are both removed below.
                match handle.sender.try_send(annotated.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => overflowed.push(*id),
                }
            }
        }

        if !stale.is_empty() {
            let removed = self.remove(&stale);
            gateway_metrics().streams_closed("revoked", removed as u64);
            info!(removed, "Disconnected connections with revoked credentials");
        }
        if !overflowed.is_empty() {
            let mut connections = self.connections.write();
            for id in overflowed {
                if let Some(handle) = connections.remove(&id) {
                    if !handle.sender.is_closed() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        gateway_metrics().streams_closed("slow_consumer", 1);
                        warn!(connection = id, identity = %handle.identity.label(), "Disconnecting slow connection");
                    }
                }
            }
        }
        delivered
    }

    fn remove(&self, ids: &[ConnectionId]) -> usize {
        let mut connections = self.connections.write();
        ids.iter().filter(|id| connections.remove(*id).is_some()).count()
    }

    fn disconnect_where(&self, matches: impl Fn(&ClientIdentity) -> bool) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|_, handle| !matches(&handle.identity));
        let removed = before - connections.len();
        gateway_metrics().streams_closed("revoked", removed as u64);
        removed
    }

    /// Close every connection authenticated with `key_id`.
    #[instrument(skip(self))]
    pub fn disconnect_key(&self, key_id: &str) -> usize {
        let removed = self.disconnect_where(|identity| identity.key_id().as_deref() == Some(key_id));
        info!(removed, "Disconnected connections of revoked key");
        removed
    }

    /// Close every connection admitted in open mode.
    pub fn disconnect_anonymous(&self) -> usize {
        let removed = self.disconnect_where(|identity| identity.key_id().is_none());
        info!(removed, "Disconnected open-mode connections");
        removed
    }

    /// Drop every connection; their queues close once drained.
    pub fn close_all(&self) {
        let count = {
            let mut connections = self.connections.write();
            let count = connections.len();
            connections.clear();
            count
        };
        info!(count, "Closed all broadcast connections");
    }
}
