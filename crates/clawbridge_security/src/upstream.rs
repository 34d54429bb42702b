//! The upstream home-automation platform as seen by the mediator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clawbridge_core::{EntityState, UpstreamEvent};
use clawbridge_error::UpstreamError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Parameters of a state-history query.
#[derive(Debug, Clone, PartialEq, derive_getters::Getters, derive_new::new)]
pub struct HistoryQuery {
    /// Start of the window
    start: DateTime<Utc>,
    /// End of the window; `None` means now
    end: Option<DateTime<Utc>>,
    /// Entities to include; never empty when it reaches upstream
    entity_ids: Vec<String>,
}

/// Operations the gateway needs from the platform it protects.
///
/// The REST and event-stream client in the server crate implements this; tests
/// substitute an in-memory double.
#[async_trait]
pub trait Upstream: Send + Sync + std::fmt::Debug {
    /// Every entity state.
    async fn query_all_states(&self) -> Result<Vec<EntityState>, UpstreamError>;

    /// One entity state, `None` when the platform does not know it.
    async fn query_state(&self, entity_id: &str) -> Result<Option<EntityState>, UpstreamError>;

    /// Available services by domain.
    async fn list_services(&self) -> Result<BTreeMap<String, Vec<String>>, UpstreamError>;

    /// Invoke one service with the given body.
    ///
    /// `return_response` asks the platform for the data a read-safe service
    /// produces instead of the list of changed states.
    async fn invoke_service(
        &self,
        domain: &str,
        service: &str,
        body: Map<String, Value>,
        return_response: bool,
    ) -> Result<Value, UpstreamError>;

    /// Recorded state history.
    async fn query_history(&self, query: &HistoryQuery) -> Result<Value, UpstreamError>;

    /// Live stream of state changes and notification actions.
    fn subscribe_events(&self) -> broadcast::Receiver<UpstreamEvent>;
}
