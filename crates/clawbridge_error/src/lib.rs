//! Error types for the ClawBridge gateway.
//!
//! Every error records the source location where it was created, following the
//! `{ kind, line, file }` pattern used across the workspace. Crate-specific errors
//! are aggregated by [`ClawbridgeError`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod error;
mod mediation;
mod storage;
mod upstream;

pub use config::ConfigError;
pub use error::{ClawbridgeError, ClawbridgeResult};
pub use mediation::{MediationError, MediationErrorKind, MediationResult};
pub use storage::{StorageError, StorageErrorKind};
pub use upstream::{UpstreamError, UpstreamErrorKind};
