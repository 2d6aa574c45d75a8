//! Relay error kinds and their JSON envelope / status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// The closed set of error tags the relay can surface to a downstream
/// caller. Kept separate from [`RelayError`] so a wrapped error's outer
/// code can be read without pattern-matching the whole enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    AuthFailed,
    KeyRevoked,
    KeyExpired,
    InvalidSignature,
    ValidationFailed,
    RateLimited,
    UpstreamFailed,
    DatabaseError,
    AuditFailed,
    InternalError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::KeyRevoked => "KEY_REVOKED",
            ErrorKind::KeyExpired => "KEY_EXPIRED",
            ErrorKind::InvalidSignature => "INVALID_SIGNATURE",
            ErrorKind::ValidationFailed => "VALIDATION_FAILED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::UpstreamFailed => "UPSTREAM_FAILED",
            ErrorKind::DatabaseError => "DATABASE_ERROR",
            ErrorKind::AuditFailed => "AUDIT_FAILED",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::AuthFailed
            | ErrorKind::KeyRevoked
            | ErrorKind::KeyExpired
            | ErrorKind::InvalidSignature => StatusCode::UNAUTHORIZED,
            ErrorKind::ValidationFailed => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamFailed => StatusCode::BAD_GATEWAY,
            ErrorKind::DatabaseError | ErrorKind::AuditFailed | ErrorKind::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Relay-level error. `Wrapped` is the only recursive variant and exists
/// solely so the upstream signing client can fold a no-response outcome
/// into UPSTREAM_FAILED while still recording what actually went wrong.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("key revoked")]
    KeyRevoked,

    #[error("key expired")]
    KeyExpired,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("rate limited")]
    RateLimited,

    #[error("upstream failed: {0}")]
    UpstreamFailed(String),

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("audit failed: {0}")]
    AuditFailed(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("{0}")]
    Wrapped(Box<RelayError>),
}

impl RelayError {
    /// The outermost non-wrapped tag. Wrapping always wins: an error
    /// wrapped inside `UPSTREAM_FAILED` surfaces as UPSTREAM_FAILED even
    /// if the inner error is e.g. RATE_LIMITED.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::AuthFailed(_) => ErrorKind::AuthFailed,
            RelayError::KeyRevoked => ErrorKind::KeyRevoked,
            RelayError::KeyExpired => ErrorKind::KeyExpired,
            RelayError::InvalidSignature => ErrorKind::InvalidSignature,
            RelayError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            RelayError::RateLimited => ErrorKind::RateLimited,
            RelayError::UpstreamFailed(_) => ErrorKind::UpstreamFailed,
            RelayError::DatabaseError(_) => ErrorKind::DatabaseError,
            RelayError::AuditFailed(_) => ErrorKind::AuditFailed,
            RelayError::InternalError(_) => ErrorKind::InternalError,
            RelayError::Wrapped(_) => ErrorKind::UpstreamFailed,
        }
    }

    pub fn wrap(self) -> RelayError {
        RelayError::Wrapped(Box::new(self))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: kind.code(),
                message,
            },
        };
        (kind.status(), Json(body)).into_response()
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        RelayError::DatabaseError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_rate_limited_surfaces_as_upstream_failed() {
        let inner = RelayError::RateLimited;
        let wrapped = inner.wrap();
        assert_eq!(wrapped.kind(), ErrorKind::UpstreamFailed);
        assert_eq!(wrapped.kind().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn unwrapped_rate_limited_is_429() {
        assert_eq!(RelayError::RateLimited.kind().status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn key_revoked_is_401() {
        assert_eq!(RelayError::KeyRevoked.kind().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RelayError::KeyRevoked.kind().code(), "KEY_REVOKED");
    }
}
