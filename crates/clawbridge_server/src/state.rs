//! Shared handler state.

use crate::BroadcastHub;
use axum::extract::FromRef;
use chrono::{DateTime, Utc};
use clawbridge_security::RequestMediator;
use std::sync::Arc;

/// Operator bearer token; `None` leaves access control to the proxy in front.
#[derive(Debug, Clone, Default)]
pub struct OperatorToken(pub Option<Arc<str>>);

/// State shared by every route.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Request mediator
    pub mediator: Arc<RequestMediator>,
    /// WebSocket fan-out
    pub hub: Arc<BroadcastHub>,
    /// Operator credential
    pub operator_token: OperatorToken,
    /// Process start, reported by the health endpoints
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// State for the given components.
    pub fn new(mediator: Arc<RequestMediator>, hub: Arc<BroadcastHub>, operator_token: Option<String>) -> Self {
        Self {
            mediator,
            hub,
            operator_token: OperatorToken(operator_token.map(Arc::from)),
            started_at: Utc::now(),
        }
    }

    /// Seconds since start.
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

impl FromRef<AppState> for OperatorToken {
    fn from_ref(state: &AppState) -> Self {
        state.operator_token.clone()
    }
}
