//! The closed error-code taxonomy (spec §7) and its HTTP envelope mapping.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

/// One of the closed set of API error codes. Every handler failure maps to
/// exactly one of these; new variants are not added lightly since clients
/// are expected to match on the string `code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    InsufficientAdminScope,
    InvalidCursor,
    InvalidEntityType,
    InvalidEntityAction,
    RateLimited,
    NotImplemented,
    Internal,
    SnapshotTooLarge,
}

impl ErrorCode {
    /// The wire-format string for this code, as used in the `rejected[].reason`
    /// field of a push response and anywhere else a code is embedded outside
    /// the `{ok:false, error:{code,...}}` envelope itself.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::InsufficientAdminScope => "insufficient_admin_scope",
            ErrorCode::InvalidCursor => "invalid_cursor",
            ErrorCode::InvalidEntityType => "invalid_entity_type",
            ErrorCode::InvalidEntityAction => "invalid_entity_action",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::NotImplemented => "not_implemented",
            ErrorCode::Internal => "internal",
            ErrorCode::SnapshotTooLarge => "snapshot_too_large",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            ErrorCode::ValidationError
            | ErrorCode::InvalidCursor
            | ErrorCode::InvalidEntityType
            | ErrorCode::InvalidEntityAction => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden | ErrorCode::InsufficientAdminScope => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict | ErrorCode::SnapshotTooLarge => StatusCode::CONFLICT,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error surfaced at the HTTP boundary. Carries the taxonomy code, a
/// human-readable message, and optional structured details. Implements
/// `IntoResponse` so handlers can simply return `Err(ApiError::not_found(...))`.
#[derive(Debug, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn insufficient_admin_scope(scope: &str) -> Self {
        Self::new(
            ErrorCode::InsufficientAdminScope,
            format!("API key is missing required scope `{scope}`"),
        )
    }

    pub fn invalid_cursor() -> Self {
        Self::new(ErrorCode::InvalidCursor, "cursor is malformed or invalid")
    }

    pub fn invalid_entity_type(entity: &str) -> Self {
        Self::new(
            ErrorCode::InvalidEntityType,
            format!("unknown entity type `{entity}`"),
        )
    }

    pub fn invalid_entity_action(entity: &str, action: &str) -> Self {
        Self::new(
            ErrorCode::InvalidEntityAction,
            format!("action `{action}` is not valid for entity `{entity}`"),
        )
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(ErrorCode::RateLimited, "rate limit exceeded").with_details(json!({
            "retry_after_secs": retry_after_secs,
        }))
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotImplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn snapshot_too_large(cap: u64) -> Self {
        Self::new(
            ErrorCode::SnapshotTooLarge,
            format!("snapshot replay would exceed the configured cap of {cap} events"),
        )
    }
}

/// Storage-layer errors never surface their driver-specific message to the
/// client (§7: "body never includes stack traces"); they are logged at the
/// point of conversion and reduced to a generic `internal` error.
impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!(err = %e, "storage error");
        ApiError::internal("internal storage error")
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(err = %e, "internal error");
        ApiError::internal("internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.code.status();
        let body = json!({
            "ok": false,
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Wraps a successful payload in the `{ok:true, data:...}` envelope.
pub fn ok_envelope<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "data": data }))
}

pub type ApiResult<T> = Result<T, ApiError>;
