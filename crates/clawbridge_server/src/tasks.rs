//! Background work: expiry sweeps, audit retention, limiter cleanup and
//! upstream event dispatch.

use crate::BroadcastHub;
use clawbridge_core::UpstreamEvent;
use clawbridge_security::RequestMediator;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const AUDIT_PRUNE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
const LIMITER_PRUNE_PERIOD: Duration = Duration::from_secs(60);

/// Handles of spawned background tasks. Dropping it leaves them running;
/// [`shutdown`](Self::shutdown) stops them.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Track a spawned task.
    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every task.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        info!(tasks = self.handles.len(), "Background tasks stopped");
    }
}

/// Expire overdue confirmations every `period`.
pub fn spawn_expiry_sweep(mediator: Arc<RequestMediator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let expired = mediator.sweep_expired();
            if expired > 0 {
                info!(expired, "Expired pending actions");
            }
        }
    })
}

/// Drop audit records older than `retention_days`, once at start and then daily.
pub fn spawn_audit_prune(mediator: Arc<RequestMediator>, retention_days: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(AUDIT_PRUNE_PERIOD);
        loop {
            ticker.tick().await;
            match mediator.audit().prune_retention(retention_days) {
                Ok(removed) => debug!(removed, retention_days, "Audit retention applied"),
                Err(e) => error!(error = %e, "Audit prune failed"),
            }
        }
    })
}

/// Forget idle rate-limit windows.
pub fn spawn_limiter_prune(mediator: Arc<RequestMediator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LIMITER_PRUNE_PERIOD);
        loop {
            ticker.tick().await;
            let pruned = mediator.limiter().prune_idle();
            if pruned > 0 {
                debug!(pruned, "Idle rate-limit windows dropped");
            }
        }
    })
}

/// Route upstream events: state changes to the mediator and the hub, notification buttons to
/// the confirmation queue.
///
/// Button presses are resolved on their own task so a slow upstream call on
/// approval never holds up state fan-out.
pub fn spawn_event_dispatch(
    mediator: Arc<RequestMediator>,
    hub: Arc<BroadcastHub>,
    mut events: broadcast::Receiver<UpstreamEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(UpstreamEvent::StateChanged(change)) => {
                    mediator.observe_change(&change);
                    hub.publish(&change);
                }
                Ok(UpstreamEvent::NotificationAction { action }) => {
                    let mediator = mediator.clone();
                    tokio::spawn(async move {
                        match mediator.resolve_notification_action(&action).await {
                            Some(Ok(resolved)) => {
                                info!(action_id = %resolved.id(), status = %resolved.status(), "Resolved from notification")
                            }
                            Some(Err(e)) => warn!(error = %e, "Notification action rejected"),
                            None => debug!(action, "Ignoring foreign notification action"),
                        }
                    });
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event dispatch fell behind the upstream stream");
                }
                Err(RecvError::Closed) => {
                    info!("Upstream event channel closed");
                    break;
                }
            }
        }
    })
}
