//! Domain-specific error types for orchestrator operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. The HTTP layer maps each
//! kind to a status code via [`ServiceError::status_code`].

use axum::http::StatusCode;

use crate::driver::DriverError;

/// Errors surfaced by the session registry, executor, and workspace gateway.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Request carried no valid API key or bearer token.
    #[error("missing or invalid authentication")]
    AuthRequired,

    /// The session exists but belongs to a different user.
    #[error("session belongs to another user")]
    Forbidden,

    /// No session is bound to the given id, or it was explicitly destroyed.
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Session id does not match the accepted `[A-Za-z0-9_.-]{1,64}` shape.
    #[error("invalid session id: {session_id}")]
    InvalidSessionId { session_id: String },

    /// Command rejected by the whitelist.
    #[error("command not allowed by whitelist: {command}")]
    CommandNotAllowed { command: String },

    /// Workspace path escapes `/workspace` or is otherwise malformed.
    #[error("invalid path: {message}")]
    PathInvalid { message: String },

    /// Workspace path does not exist inside the container.
    #[error("path not found: {path}")]
    PathNotFound { path: String },

    /// Workspace read/write over the configured file size limit.
    #[error("size limit exceeded: {size} bytes (limit {limit})")]
    SizeLimitExceeded { size: u64, limit: u64 },

    /// Per-user request budget exhausted for the current window.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Container engine is unreachable or persistently failing.
    #[error("container engine unavailable: {message}")]
    EngineUnavailable { message: String },

    /// Engine reported resource exhaustion (OOM, pids limit).
    #[error("engine resources exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Unexpected failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ServiceError {
    /// Creates a `SessionNotFound` error.
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates an `InvalidSessionId` error.
    pub fn invalid_session_id(session_id: impl Into<String>) -> Self {
        Self::InvalidSessionId {
            session_id: session_id.into(),
        }
    }

    /// Creates a `CommandNotAllowed` error.
    pub fn command_not_allowed(command: impl Into<String>) -> Self {
        Self::CommandNotAllowed {
            command: command.into(),
        }
    }

    /// Creates a `PathInvalid` error.
    pub fn path_invalid(message: impl Into<String>) -> Self {
        Self::PathInvalid {
            message: message.into(),
        }
    }

    /// Creates a `PathNotFound` error.
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound { path: path.into() }
    }

    /// Creates an `EngineUnavailable` error.
    pub fn engine_unavailable(message: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a not-found error (session or path).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. } | Self::PathNotFound { .. }
        )
    }

    /// The HTTP status the API layer responds with for this kind.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::SessionNotFound { .. } | Self::PathNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidSessionId { .. }
            | Self::CommandNotAllowed { .. }
            | Self::PathInvalid { .. }
            | Self::SizeLimitExceeded { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::EngineUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ResourceExhausted { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<DriverError> for ServiceError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::EngineUnavailable { message } => Self::EngineUnavailable { message },
            DriverError::Timeout { timeout_secs } => Self::EngineUnavailable {
                message: format!("engine operation timed out after {timeout_secs} seconds"),
            },
            DriverError::NotFound { message }
            | DriverError::Conflict { message }
            | DriverError::Other { message } => {
                let lower = message.to_lowercase();
                if lower.contains("out of memory")
                    || lower.contains("oom")
                    || lower.contains("pids limit")
                {
                    Self::ResourceExhausted { message }
                } else {
                    Self::Internal { message }
                }
            }
        }
    }
}
