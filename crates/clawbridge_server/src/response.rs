//! Error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use clawbridge_error::{ClawbridgeError, MediationError, StorageError, UpstreamError};
use serde_json::json;
use tracing::error;

/// Any failure a handler returns, rendered as `{error, reason}`.
#[derive(Debug, derive_more::Display, derive_more::From)]
#[display("{}", _0)]
pub struct ApiError(ClawbridgeError);

impl ApiError {
    /// Status code and body for this error.
    pub fn parts(&self) -> (StatusCode, serde_json::Value) {
        match &self.0 {
            ClawbridgeError::Mediation(err) => {
                let status = StatusCode::from_u16(err.kind.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (
                    status,
                    json!({ "error": err.kind.client_message(), "reason": err.kind.reason_code() }),
                )
            }
            ClawbridgeError::Upstream(err) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": err.kind.to_string(), "reason": "upstream_error" }),
            ),
            ClawbridgeError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Failed to persist change", "reason": "storage_error" }),
            ),
            ClawbridgeError::Config(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": err.message, "reason": "config_error" }),
            ),
        }
    }
}

impl From<MediationError> for ApiError {
    fn from(err: MediationError) -> Self {
        Self(err.into())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        Self(err.into())
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ClawbridgeError::Storage(err) = &self.0 {
            error!(error = %err, "Persistence failure");
        }
        let (status, body) = self.parts();
        (status, Json(body)).into_response()
    }
}

/// Result type for handlers.
pub type ApiResult<T> = Result<T, ApiError>;
