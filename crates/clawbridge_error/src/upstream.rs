//! Upstream platform error types.

/// Kinds of upstream platform failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum UpstreamErrorKind {
    /// Transport-level HTTP failure
    #[display("HTTP request failed: {}", _0)]
    Http(String),
    /// Platform answered with a non-success status
    #[display("Platform returned HTTP {}: {}", status, body)]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },
    /// Response body could not be decoded
    #[display("Failed to decode response: {}", _0)]
    Decode(String),
    /// Event stream failure
    #[display("WebSocket error: {}", _0)]
    WebSocket(String),
    /// Platform rejected our credentials
    #[display("Authentication failed: {}", _0)]
    Auth(String),
}

/// Upstream error with location tracking.
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Upstream Error: {} at line {} in {}", kind, line, file)]
pub struct UpstreamError {
    /// The kind of error that occurred
    pub kind: UpstreamErrorKind,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl UpstreamError {
    /// Create a new upstream error with automatic location tracking.
    #[track_caller]
    pub fn new(kind: UpstreamErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }
}
