//! HTTP error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use kwengine_shared::KwEngineError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Statistics credential missing or rejected (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Statistics quota exhausted (429)
    #[error("Quota exceeded: {0}")]
    Quota(String),

    /// Statistics service failed or answered garbage (502)
    #[error("Upstream failure: {0}")]
    BadGateway(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<KwEngineError> for ApiError {
    fn from(err: KwEngineError) -> Self {
        let message = err.to_string();
        match err {
            KwEngineError::Auth(_) => Self::Unauthorized(message),
            KwEngineError::Validation { .. } => Self::BadRequest(message),
            KwEngineError::Quota(_) => Self::Quota(message),
            KwEngineError::Upstream(_) | KwEngineError::MalformedResponse(_) => {
                Self::BadGateway(message)
            }
            KwEngineError::Config { .. }
            | KwEngineError::Storage(_)
            | KwEngineError::Io { .. } => Self::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::Quota(msg) => (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
