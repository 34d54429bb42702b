//! Error types for rate limiting operations.

/// Error kinds for rate limiting operations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
pub enum RateLimitErrorKind {
    /// Identity used up its budget for the current window.
    #[display(
        "Rate limit exceeded for {identity}: {limit} requests per window, retry in {retry_after_secs}s"
    )]
    LimitExceeded {
        /// Identity that hit the limit
        identity: String,
        /// Budget that applied
        limit: u32,
        /// Seconds until enough budget frees up
        retry_after_secs: u64,
    },
    /// A single request costs more than the whole budget.
    #[display("Request cost {cost} exceeds limit {limit} for {identity}")]
    CostExceedsLimit {
        /// Identity that made the request
        identity: String,
        /// Cost of the request
        cost: u32,
        /// Budget that applied
        limit: u32,
    },
}

impl RateLimitErrorKind {
    /// Identity the error concerns.
    pub fn identity(&self) -> &str {
        match self {
            Self::LimitExceeded { identity, .. } | Self::CostExceedsLimit { identity, .. } => {
                identity
            }
        }
    }
}

/// Rate limiting error with location tracking.
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Rate Limit Error: {} at line {} in {}", kind, line, file)]
pub struct RateLimitError {
    kind: RateLimitErrorKind,
    line: u32,
    file: &'static str,
}

impl RateLimitError {
    /// Create a new rate limiting error with automatic location tracking.
    #[track_caller]
    pub fn new(kind: RateLimitErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> &RateLimitErrorKind {
        &self.kind
    }
}
