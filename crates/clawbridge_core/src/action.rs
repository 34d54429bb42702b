//! Pending actions awaiting human approval.

use crate::ServiceCall;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Confirmation state. Transitions only leave `Pending`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ActionStatus {
    /// Awaiting a decision
    Pending,
    /// Approved and forwarded upstream
    Approved,
    /// Denied by a human
    Denied,
    /// Timed out before a decision
    Expired,
}

impl ActionStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self != ActionStatus::Pending
    }
}

/// A confirm-level service call held for approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_getters::Getters)]
pub struct PendingAction {
    /// Opaque, unguessable identifier
    id: String,
    /// Call to forward on approval (already clamped)
    #[serde(flatten)]
    call: ServiceCall,
    /// Key that requested the action, if any
    key_id: Option<String>,
    /// Attribution of the requester
    requested_by: String,
    /// Creation time
    created_at: DateTime<Utc>,
    /// Deadline for a decision
    expires_at: DateTime<Utc>,
    /// Current state
    status: ActionStatus,
    /// When the action left `Pending`
    resolved_at: Option<DateTime<Utc>>,
    /// Upstream response after approval
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    /// Upstream error after approval
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PendingAction {
    /// Create a pending action.
    pub fn new(
        id: impl Into<String>,
        call: ServiceCall,
        key_id: Option<String>,
        requested_by: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            call,
            key_id,
            requested_by: requested_by.into(),
            created_at,
            expires_at,
            status: ActionStatus::Pending,
            resolved_at: None,
            result: None,
            error: None,
        }
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Move out of `Pending`. Returns `false` without changing anything when
    /// the action is already terminal.
    pub fn transition(&mut self, to: ActionStatus, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || to == ActionStatus::Pending {
            return false;
        }
        self.status = to;
        self.resolved_at = Some(now);
        true
    }

    /// Record what upstream answered after approval.
    pub fn record_outcome(&mut self, outcome: Result<Value, String>) {
        match outcome {
            Ok(value) => self.result = Some(value),
            Err(message) => self.error = Some(message),
        }
    }
}
