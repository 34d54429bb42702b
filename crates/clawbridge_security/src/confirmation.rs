//! Human-approval queue for confirm-level service calls.
//!
//! Every action sits behind its own mutex; all status changes are made under
//! that mutex and only from `Pending`, so concurrent approve, deny and expiry
//! on one action always settle on exactly one terminal state.

use chrono::Duration;
use clawbridge_core::{ActionStatus, Clock, PendingAction, ServiceCall};
use clawbridge_error::{MediationError, MediationErrorKind, MediationResult};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

/// Shortest allowed confirmation window in seconds.
pub const MIN_CONFIRM_TIMEOUT_SECS: u64 = 10;
/// Longest allowed confirmation window in seconds.
pub const MAX_CONFIRM_TIMEOUT_SECS: u64 = 600;
/// How long resolved actions stay pollable.
const RESOLVED_RETENTION_SECS: i64 = 3600;

/// Called once for every action that times out.
pub type ExpiryHook = Arc<dyn Fn(&PendingAction) + Send + Sync>;

type Slot = Arc<Mutex<PendingAction>>;

/// Pending human-approval actions with expiry.
///
/// Actions live in memory only; in-flight confirmations do not survive a restart.
pub struct ConfirmationQueue {
    actions: Mutex<HashMap<String, Slot>>,
    timeout_secs: AtomicU64,
    clock: Arc<dyn Clock>,
    on_expired: RwLock<Option<ExpiryHook>>,
}

impl std::fmt::Debug for ConfirmationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationQueue")
            .field("actions", &self.actions.lock().len())
            .field("timeout_secs", &self.timeout_secs())
            .finish()
    }
}

impl ConfirmationQueue {
    /// Queue with the given window, clamped to the allowed range.
    pub fn new(timeout_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            actions: Mutex::new(HashMap::new()),
            timeout_secs: AtomicU64::new(clamp_timeout(timeout_secs)),
            clock,
            on_expired: RwLock::new(None),
        }
    }

    /// Register the callback fired for each expired action.
    pub fn set_expiry_hook(&self, hook: ExpiryHook) {
        *self.on_expired.write() = Some(hook);
    }

    /// Current confirmation window in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.load(Ordering::Relaxed)
    }

    /// Change the window for actions created from now on.
    pub fn set_timeout_secs(&self, secs: u64) {
        self.timeout_secs.store(clamp_timeout(secs), Ordering::Relaxed);
    }

    /// Hold a call for approval.
    #[instrument(skip(self, call), fields(entity_id = %call.entity_id()))]
    pub fn enqueue(&self, call: ServiceCall, key_id: Option<String>, requested_by: String) -> PendingAction {
        let now = self.clock.now();
        let expires_at = now + Duration::seconds(self.timeout_secs() as i64);
        let id = uuid::Uuid::new_v4().simple().to_string();
        let action = PendingAction::new(id.clone(), call, key_id, requested_by, now, expires_at);
        self.actions
            .lock()
            .insert(id.clone(), Arc::new(Mutex::new(action.clone())));
        info!(action_id = %id, %expires_at, "Action awaiting confirmation");
        action
    }

    fn slot(&self, action_id: &str) -> MediationResult<Slot> {
        self.actions
            .lock()
            .get(action_id)
            .cloned()
            .ok_or_else(|| MediationError::new(MediationErrorKind::NotFound(format!("action {}", action_id))))
    }

    fn fire_expired(&self, action: &PendingAction) {
        let hook = self.on_expired.read().clone();
        if let Some(hook) = hook {
            hook(action);
        }
    }

    /// Run `decide` on an action after applying any due expiry.
    fn with_action<T>(
        &self,
        action_id: &str,
        decide: impl FnOnce(&mut PendingAction) -> MediationResult<T>,
    ) -> MediationResult<T> {
        let slot = self.slot(action_id)?;
        let now = self.clock.now();
        let (expired, out) = {
            let mut action = slot.lock();
            let expired = *action.status() == ActionStatus::Pending
                && action.is_past_deadline(now)
                && action.transition(ActionStatus::Expired, now);
            let snapshot = expired.then(|| action.clone());
            (snapshot, decide(&mut action))
        };
        if let Some(action) = expired {
            debug!(action_id, "Action expired");
            self.fire_expired(&action);
        }
        out
    }

    /// Current state of an action. Safe to poll.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub fn status(&self, action_id: &str) -> MediationResult<PendingAction> {
        self.with_action(action_id, |action| Ok(action.clone()))
    }

    /// Claim a pending action for execution.
    ///
    /// On success the action is already `approved`; the caller forwards the
    /// returned call and reports back with [`complete`](Self::complete).
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `Conflict` when the action is no longer pending.
    #[instrument(skip(self))]
    pub fn begin_approve(&self, action_id: &str) -> MediationResult<PendingAction> {
        let now = self.clock.now();
        self.with_action(action_id, |action| {
            if !action.transition(ActionStatus::Approved, now) {
                return Err(conflict(action));
            }
            Ok(action.clone())
        })
    }

    /// Record the upstream outcome of an approved action.
    pub fn complete(&self, action_id: &str, outcome: Result<Value, String>) {
        if let Ok(slot) = self.slot(action_id) {
            slot.lock().record_outcome(outcome);
        }
    }

    /// Deny a pending action.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `Conflict` when the action is no longer pending.
    #[instrument(skip(self))]
    pub fn deny(&self, action_id: &str) -> MediationResult<PendingAction> {
        let now = self.clock.now();
        self.with_action(action_id, |action| {
            if !action.transition(ActionStatus::Denied, now) {
                return Err(conflict(action));
            }
            Ok(action.clone())
        })
    }

    /// Expire every overdue action and forget long-resolved ones.
    ///
    /// Returns the actions that expired in this sweep.
    #[instrument(skip(self))]
    pub fn sweep(&self) -> Vec<PendingAction> {
        let now = self.clock.now();
        let forget_before = now - Duration::seconds(RESOLVED_RETENTION_SECS);
        let slots: Vec<(String, Slot)> = self
            .actions
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut expired = Vec::new();
        let mut forgotten = Vec::new();
        for (id, slot) in slots {
            let mut action = slot.lock();
            if action.is_past_deadline(now) && action.transition(ActionStatus::Expired, now) {
                expired.push(action.clone());
            } else if action
                .resolved_at()
                .is_some_and(|resolved| resolved < forget_before)
            {
                forgotten.push(id);
            }
        }
        if !forgotten.is_empty() {
            let mut actions = self.actions.lock();
            for id in &forgotten {
                actions.remove(id);
            }
        }
        for action in &expired {
            self.fire_expired(action);
        }
        if !expired.is_empty() || !forgotten.is_empty() {
            debug!(expired = expired.len(), forgotten = forgotten.len(), "Confirmation sweep");
        }
        expired
    }

    /// Every tracked action, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<ActionStatus>) -> Vec<PendingAction> {
        let slots: Vec<Slot> = self.actions.lock().values().cloned().collect();
        let mut actions: Vec<PendingAction> = slots
            .iter()
            .map(|slot| slot.lock().clone())
            .filter(|action| status.is_none_or(|s| *action.status() == s))
            .collect();
        actions.sort_by(|a, b| b.created_at().cmp(a.created_at()));
        actions
    }
}

fn clamp_timeout(secs: u64) -> u64 {
    secs.clamp(MIN_CONFIRM_TIMEOUT_SECS, MAX_CONFIRM_TIMEOUT_SECS)
}

#[track_caller]
fn conflict(action: &PendingAction) -> MediationError {
    MediationError::new(MediationErrorKind::Conflict {
        action_id: action.id().clone(),
        status: action.status().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clawbridge_core::ManualClock;
    use serde_json::Map;

    fn queue() -> (Arc<ManualClock>, ConfirmationQueue) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (clock.clone(), ConfirmationQueue::new(120, clock))
    }

    fn call() -> ServiceCall {
        ServiceCall::new("lock", "unlock", "lock.front_door", Map::new())
    }

    #[test]
    fn test_timeout_is_clamped() {
        let (_, queue) = queue();
        queue.set_timeout_secs(1);
        assert_eq!(queue.timeout_secs(), 10);
        queue.set_timeout_secs(100_000);
        assert_eq!(queue.timeout_secs(), 600);
    }

    #[test]
    fn test_ids_are_unguessable() {
        let (_, queue) = queue();
        let a = queue.enqueue(call(), None, "10.0.0.1".into());
        let b = queue.enqueue(call(), None, "10.0.0.1".into());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
    }

    #[test]
    fn test_deny_then_approve_conflicts() {
        let (_, queue) = queue();
        let action = queue.enqueue(call(), None, "10.0.0.1".into());
        queue.deny(action.id()).unwrap();
        let err = queue.begin_approve(action.id()).unwrap_err();
        assert_eq!(err.kind.reason_code(), "conflict");
        assert_eq!(*queue.status(action.id()).unwrap().status(), ActionStatus::Denied);
    }

    #[test]
    fn test_lazy_expiry_fires_hook_once() {
        let (clock, queue) = queue();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        queue.set_expiry_hook(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let action = queue.enqueue(call(), None, "10.0.0.1".into());
        clock.advance(Duration::seconds(121));
        assert_eq!(*queue.status(action.id()).unwrap().status(), ActionStatus::Expired);
        assert_eq!(*queue.status(action.id()).unwrap().status(), ActionStatus::Expired);
        assert!(queue.sweep().is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_forgets_old_resolutions() {
        let (clock, queue) = queue();
        let action = queue.enqueue(call(), None, "10.0.0.1".into());
        queue.deny(action.id()).unwrap();
        clock.advance(Duration::seconds(RESOLVED_RETENTION_SECS + 1));
        queue.sweep();
        assert!(queue.status(action.id()).is_err());
    }
}
