//! Core data types for the ClawBridge access-mediation gateway.
//!
//! This crate holds the data model shared by the security layer and the HTTP
//! server: access levels and policies, schedules, client identities, pending
//! actions, audit records and entity states.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod access;
mod action;
mod api_key;
mod audit;
mod clock;
mod group;
mod identity;
mod metrics;
mod observability;
mod policy;
mod request;
mod schedule;
mod state;

pub use access::{AccessLevel, DomainTables, entity_domain};
pub use action::{ActionStatus, PendingAction};
pub use api_key::{ApiKeyRecord, ApiKeySummary};
pub use audit::{AuditQuery, AuditRecord, AuditResult, AuditStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use group::EntityGroup;
pub use identity::ClientIdentity;
pub use metrics::{GatewayMetrics, gateway_metrics};
pub use observability::{init_observability, init_tracing};
pub use policy::{ClampedParam, EntityPolicy, MAX_ANNOTATION_CHARS, ParamConstraint, clamp_params};
pub use request::{EXPANDING_TARGET_KEYS, ServiceCall, ServiceRequest};
pub use schedule::{ALL_WEEKDAYS, GatewayTimezone, Schedule};
pub use state::{EntityState, StateChange, UpstreamEvent};
