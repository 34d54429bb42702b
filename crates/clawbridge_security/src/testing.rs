//! In-memory doubles of the upstream platform and the notifier.

use crate::{ApprovalNotice, HistoryQuery, Notifier, Upstream};
use async_trait::async_trait;
use clawbridge_core::{EntityState, UpstreamEvent};
use clawbridge_error::{UpstreamError, UpstreamErrorKind};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// One service call that reached the fake platform.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokedService {
    /// Service domain
    pub domain: String,
    /// Service name
    pub service: String,
    /// Body as sent
    pub body: Map<String, Value>,
    /// Whether response data was requested
    pub return_response: bool,
}

/// Fake platform holding states and a service catalogue in memory.
#[derive(Debug)]
pub struct InMemoryUpstream {
    states: RwLock<BTreeMap<String, EntityState>>,
    services: RwLock<BTreeMap<String, Vec<String>>>,
    invocations: Mutex<Vec<InvokedService>>,
    history_queries: Mutex<Vec<HistoryQuery>>,
    failing: AtomicBool,
    events: broadcast::Sender<UpstreamEvent>,
}

impl Default for InMemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryUpstream {
    /// Empty platform.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            states: RwLock::new(BTreeMap::new()),
            services: RwLock::new(BTreeMap::new()),
            invocations: Mutex::new(Vec::new()),
            history_queries: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            events,
        }
    }

    /// Add an entity in the given state with a friendly name.
    pub fn with_entity(self, entity_id: &str, state: &str, friendly_name: &str) -> Self {
        let attributes = json!({ "friendly_name": friendly_name })
            .as_object()
            .cloned()
            .unwrap_or_default();
        self.set_state(EntityState::new(entity_id, state, attributes));
        self
    }

    /// Register services for a domain.
    pub fn with_services(self, domain: &str, services: &[&str]) -> Self {
        self.services.write().insert(
            domain.to_string(),
            services.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Insert or replace a state.
    pub fn set_state(&self, state: EntityState) {
        self.states.write().insert(state.entity_id().clone(), state);
    }

    /// Make every subsequent service call fail (or succeed again).
    pub fn fail_invocations(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Service calls received so far.
    pub fn invocations(&self) -> Vec<InvokedService> {
        self.invocations.lock().clone()
    }

    /// Number of service calls received so far.
    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    /// History queries received so far.
    pub fn history_queries(&self) -> Vec<HistoryQuery> {
        self.history_queries.lock().clone()
    }

    /// Publish an event to subscribers. Returns how many received it.
    pub fn emit(&self, event: UpstreamEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl Upstream for InMemoryUpstream {
    async fn query_all_states(&self) -> Result<Vec<EntityState>, UpstreamError> {
        Ok(self.states.read().values().cloned().collect())
    }

    async fn query_state(&self, entity_id: &str) -> Result<Option<EntityState>, UpstreamError> {
        Ok(self.states.read().get(entity_id).cloned())
    }

    async fn list_services(&self) -> Result<BTreeMap<String, Vec<String>>, UpstreamError> {
        Ok(self.services.read().clone())
    }

    async fn invoke_service(
        &self,
        domain: &str,
        service: &str,
        body: Map<String, Value>,
        return_response: bool,
    ) -> Result<Value, UpstreamError> {
        self.invocations.lock().push(InvokedService {
            domain: domain.to_string(),
            service: service.to_string(),
            body: body.clone(),
            return_response,
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::new(UpstreamErrorKind::Status {
                status: 500,
                body: "service failed".to_string(),
            }));
        }
        Ok(json!([{ "entity_id": body.get("entity_id"), "service": format!("{}.{}", domain, service) }]))
    }

    async fn query_history(&self, query: &HistoryQuery) -> Result<Value, UpstreamError> {
        self.history_queries.lock().push(query.clone());
        Ok(Value::Array(
            query
                .entity_ids()
                .iter()
                .map(|id| json!([{ "entity_id": id, "state": "on" }]))
                .collect(),
        ))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.events.subscribe()
    }
}

/// Notifier that keeps every notice it is given.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<ApprovalNotice>>,
}

impl RecordingNotifier {
    /// Notices received so far.
    pub fn notices(&self) -> Vec<ApprovalNotice> {
        self.notices.lock().clone()
    }

    /// Wait until at least `count` notices arrived, up to one second.
    pub async fn wait_for(&self, count: usize) -> Vec<ApprovalNotice> {
        for _ in 0..100 {
            if self.notices.lock().len() >= count {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        self.notices()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_approval(&self, notice: &ApprovalNotice) -> Result<(), UpstreamError> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}
