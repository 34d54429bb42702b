//! Mediation outcome errors.
//!
//! These are the decisions the request pipeline can reach short of success. Each
//! kind maps to exactly one client-visible reason code and HTTP status.

/// Kinds of mediation failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum MediationErrorKind {
    /// Entity is absent or switched off. Must stay indistinguishable from
    /// an entity that does not exist.
    #[display("Entity not found: {}", _0)]
    NotExposed(String),
    /// Entity access level does not permit the requested service.
    #[display("Entity {} is read-only", _0)]
    ReadOnly(String),
    /// Entity schedule does not allow control right now.
    #[display("Entity {} is outside its allowed schedule", _0)]
    OutsideSchedule(String),
    /// Requested domain does not match the entity's domain.
    #[display("Domain mismatch: service domain {} does not match entity domain {}", requested, entity)]
    DomainMismatch {
        /// Domain named in the request path
        requested: String,
        /// Domain of the target entity
        entity: String,
    },
    /// Identity exceeded its request budget.
    #[display("Rate limit exceeded for {}", _0)]
    RateLimited(String),
    /// Credential missing or invalid.
    #[display("Unauthorized: {}", _0)]
    Unauthorized(String),
    /// Entity is outside the API key's scope.
    #[display("Entity {} is outside the key scope", _0)]
    OutOfScope(String),
    /// The upstream platform rejected or failed the call.
    #[display("Upstream error: {}", _0)]
    UpstreamError(String),
    /// Confirmation action was already resolved.
    #[display("Action {} is already {}", action_id, status)]
    Conflict {
        /// Action identifier
        action_id: String,
        /// Terminal status the action is in
        status: String,
    },
    /// Illegal registry mutation.
    #[display("Invalid policy: {}", _0)]
    InvalidPolicy(String),
    /// Malformed client input.
    #[display("Bad request: {}", _0)]
    BadRequest(String),
    /// Unknown action, schedule, group or key.
    #[display("Not found: {}", _0)]
    NotFound(String),
}

impl MediationErrorKind {
    /// Stable snake_case code returned to clients.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotExposed(_) => "not_exposed",
            Self::ReadOnly(_) => "read_only",
            Self::OutsideSchedule(_) => "outside_schedule",
            Self::DomainMismatch { .. } => "domain_mismatch",
            Self::RateLimited(_) => "rate_limited",
            Self::Unauthorized(_) => "unauthorized",
            Self::OutOfScope(_) => "out_of_scope",
            Self::UpstreamError(_) => "upstream_error",
            Self::Conflict { .. } => "conflict",
            Self::InvalidPolicy(_) => "invalid_policy",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
        }
    }

    /// HTTP status code for this outcome.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotExposed(_) | Self::NotFound(_) => 404,
            Self::ReadOnly(_) | Self::OutsideSchedule(_) | Self::OutOfScope(_) => 403,
            Self::DomainMismatch { .. } | Self::InvalidPolicy(_) | Self::BadRequest(_) => 400,
            Self::RateLimited(_) => 429,
            Self::Unauthorized(_) => 401,
            Self::UpstreamError(_) => 502,
            Self::Conflict { .. } => 409,
        }
    }

    /// Message safe to show to an untrusted client.
    ///
    /// `NotExposed` never echoes anything that distinguishes an unknown entity
    /// from one that is switched off.
    pub fn client_message(&self) -> String {
        match self {
            Self::NotExposed(_) => "Entity not found".to_string(),
            other => other.to_string(),
        }
    }
}

/// Mediation error with location tracking.
///
/// # Examples
///
/// ```
/// use clawbridge_error::{MediationError, MediationErrorKind};
///
/// let err = MediationError::new(MediationErrorKind::ReadOnly("sensor.temp".into()));
/// assert_eq!(err.kind.reason_code(), "read_only");
/// assert_eq!(err.kind.http_status(), 403);
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Mediation Error: {} at line {} in {}", kind, line, file)]
pub struct MediationError {
    /// The kind of outcome
    pub kind: MediationErrorKind,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl MediationError {
    /// Create a new mediation error with automatic location tracking.
    #[track_caller]
    pub fn new(kind: MediationErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> &MediationErrorKind {
        &self.kind
    }
}

impl From<MediationErrorKind> for MediationError {
    #[track_caller]
    fn from(kind: MediationErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Result type for mediation decisions.
pub type MediationResult<T> = Result<T, MediationError>;
