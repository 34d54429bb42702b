//! Gateway-wide error aggregate.

use crate::{ConfigError, MediationError, StorageError, UpstreamError};

/// Any error the gateway can produce.
#[derive(Debug, Clone, derive_more::From, derive_more::Display, derive_more::Error)]
pub enum ClawbridgeError {
    /// Pipeline or policy decision
    #[display("{}", _0)]
    Mediation(MediationError),
    /// Persistence failure
    #[display("{}", _0)]
    Storage(StorageError),
    /// Invalid configuration
    #[display("{}", _0)]
    Config(ConfigError),
    /// Upstream platform failure
    #[display("{}", _0)]
    Upstream(UpstreamError),
}

impl ClawbridgeError {
    /// The mediation error, if this is one.
    pub fn as_mediation(&self) -> Option<&MediationError> {
        match self {
            Self::Mediation(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type for gateway operations.
pub type ClawbridgeResult<T> = Result<T, ClawbridgeError>;
