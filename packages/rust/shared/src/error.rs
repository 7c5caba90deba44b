//! Error types for kwengine.
//!
//! Library crates use [`KwEngineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all kwengine operations.
#[derive(Debug, thiserror::Error)]
pub enum KwEngineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Missing or rejected credential for the statistics service.
    #[error("auth error: {0}")]
    Auth(String),

    /// The statistics service rejected the call for quota reasons.
    #[error("quota error: {0}")]
    Quota(String),

    /// Statistics service 5xx, transport failure, or timeout.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The statistics service answered with an unexpected payload.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed snapshot, bad request, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, KwEngineError>;

impl KwEngineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable tag used when errors are serialized into batch outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Auth(_) => "auth",
            Self::Quota(_) => "quota",
            Self::Upstream(_) => "upstream",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
        }
    }

    /// Errors that abort a whole batch instead of a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Errors worth another attempt through the rate limiter.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Quota(_) | Self::Upstream(_))
    }
}
