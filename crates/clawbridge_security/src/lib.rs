//! Policy enforcement for the ClawBridge gateway.
//!
//! This crate owns the state the gateway enforces (exposure registry, API keys,
//! pending confirmations, audit log) and the [`RequestMediator`] that applies it
//! to every client request. The upstream platform and the approval channel are
//! reached through the [`Upstream`] and [`Notifier`] traits.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod api_keys;
mod audit;
mod confirmation;
mod ids;
mod mediator;
mod notifier;
mod registry;
mod schedule;
mod store;
mod summary;
mod upstream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api_keys::{ApiKeyStore, IssuedKey};
pub use audit::AuditLog;
pub use confirmation::{
    ConfirmationQueue, ExpiryHook, MAX_CONFIRM_TIMEOUT_SECS, MIN_CONFIRM_TIMEOUT_SECS,
};
pub use mediator::{
    CallOutcome, EntityOutcome, MediatorSettings, NOTIFICATION_SOURCE, OPERATOR_SOURCE,
    RequestMediator, RequestMediatorBuilder, RequestMediatorBuilderError,
};
pub use notifier::{
    APPROVE_ACTION_PREFIX, ApprovalNotice, DENY_ACTION_PREFIX, NoopNotifier, NotificationDecision,
    Notifier, parse_notification_action,
};
pub use registry::{
    ExposureRegistry, GroupUpdate, NewGroup, NewSchedule, PolicyView, RegistrySnapshot,
    ScheduleUpdate,
};
pub use schedule::ScheduleEvaluator;
pub use store::JsonStore;
pub use summary::{SUMMARY_ATTRIBUTES, SensorEntry, SensorSummary};
pub use upstream::{HistoryQuery, Upstream};
