//! API error types and handling.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// API error response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// API error type.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Risk or mode policy refused the command.
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Broker error: {0}")]
    Broker(String),

    /// Safe mode or a dependency is down.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid JSON: {0}")]
    JsonRejection(String),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::PolicyDenied(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Broker(_) => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::JsonRejection(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::PolicyDenied(_) => "POLICY_DENIED",
            ApiError::Broker(_) => "BROKER_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
            ApiError::JsonRejection(_) => "INVALID_JSON",
        }
    }
}

impl From<signal_core::Error> for ApiError {
    fn from(err: signal_core::Error) -> Self {
        use signal_core::Error;

        match err {
            Error::Validation { message } => ApiError::Validation(message),
            Error::Auth { message } => ApiError::Unauthorized(message),
            Error::PolicyDenied { reason } => ApiError::PolicyDenied(reason),
            Error::NotFound(what) => ApiError::NotFound(what),
            Error::Conflict(message) => ApiError::Conflict(message),
            Error::InvalidTransition { from, to } => {
                ApiError::Conflict(format!("cannot move from {} to {}", from, to))
            }
            Error::StateCorruption { message } => ApiError::ServiceUnavailable(message),
            Error::Broker(e) => ApiError::Broker(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::warn!(error = %rejection, "JSON parsing failed");
        ApiError::JsonRejection(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                error_code = self.error_code(),
                error = %self,
                "Internal server error"
            );
        }

        let body = ErrorResponse::new(self.error_code(), self.to_string());

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::BrokerError;

    #[test]
    fn test_core_errors_map_to_status() {
        let cases = [
            (signal_core::Error::validation("bad"), StatusCode::UNPROCESSABLE_ENTITY),
            (
                signal_core::Error::Auth {
                    message: "nope".to_string(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (signal_core::Error::denied("paused"), StatusCode::UNPROCESSABLE_ENTITY),
            (
                signal_core::Error::Conflict("filled".to_string()),
                StatusCode::CONFLICT,
            ),
            (
                signal_core::Error::NotFound("order".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                signal_core::Error::StateCorruption {
                    message: "mismatch".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                signal_core::Error::Broker(BrokerError::timeout("slow")),
                StatusCode::BAD_GATEWAY,
            ),
            (signal_core::Error::config("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_error_body_carries_code() {
        let response = ApiError::Conflict("order already filled".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
