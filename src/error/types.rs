/**
 * Service Error Types
 *
 * One error enum covers the whole service. Each variant carries enough
 * context to render the client-facing envelope and to pick the right
 * WebSocket close code for session-path failures.
 */

use axum::http::StatusCode;
use thiserror::Error;

/// WebSocket close codes used by the session runtime.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Server going away (graceful shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Internal error (transient store failure, protocol violation).
    pub const INTERNAL: u16 = 1011;
    /// Bearer token missing, malformed or expired.
    pub const UNAUTHENTICATED: u16 = 4401;
    /// Authenticated but not permitted on this document.
    pub const FORBIDDEN: u16 = 4403;
    /// Document does not exist or is soft-deleted.
    pub const NOT_FOUND: u16 = 4404;
}

/// Service-wide error type.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Bearer token is malformed, unsigned, revoked or otherwise invalid
    #[error("invalid token: {0}")]
    AuthInvalid(String),

    /// Bearer token was valid once but has expired
    #[error("token expired")]
    AuthExpired,

    /// The authenticated user lacks the required permission
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The referenced object does not exist (or is soft-deleted)
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness or state constraint was violated
    #[error("conflict: {0}")]
    Conflict(String),

    /// Client input failed validation
    #[error("validation failed for '{field}': {message}")]
    ValidationFailed {
        /// The offending field
        field: String,
        /// Human-readable description
        message: String,
    },

    /// A dependency (DB, blob store, identity service) failed transiently
    #[error("transient failure: {0}")]
    Transient(String),

    /// An invariant was violated; the affected resource must be quarantined
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    /// Shorthand for a transient dependency failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Shorthand for a validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The machine-readable code used in the client-facing envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthInvalid(_) | Self::AuthExpired => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ValidationFailed { .. } => "validation_error",
            Self::Transient(_) | Self::Fatal(_) => "server_error",
        }
    }

    /// HTTP status for REST-path responses.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthInvalid(_) | Self::AuthExpired => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            Self::Transient(_) | Self::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// WebSocket close code for session-path failures.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AuthInvalid(_) | Self::AuthExpired => close::UNAUTHENTICATED,
            Self::Forbidden(_) => close::FORBIDDEN,
            Self::NotFound(_) => close::NOT_FOUND,
            _ => close::INTERNAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_codes() {
        assert_eq!(ServiceError::AuthExpired.code(), "unauthorized");
        assert_eq!(ServiceError::Forbidden("no read".into()).code(), "forbidden");
        assert_eq!(ServiceError::NotFound("doc".into()).code(), "not_found");
        assert_eq!(ServiceError::Conflict("dup".into()).code(), "conflict");
        assert_eq!(
            ServiceError::validation("title", "empty").code(),
            "validation_error"
        );
        assert_eq!(ServiceError::transient("db down").code(), "server_error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::AuthInvalid("bad".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServiceError::Forbidden("nope".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServiceError::transient("blob").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(ServiceError::AuthExpired.close_code(), close::UNAUTHENTICATED);
        assert_eq!(
            ServiceError::Forbidden("read only".into()).close_code(),
            close::FORBIDDEN
        );
        assert_eq!(
            ServiceError::NotFound("doc".into()).close_code(),
            close::NOT_FOUND
        );
        assert_eq!(ServiceError::transient("db").close_code(), close::INTERNAL);
        assert_eq!(ServiceError::Fatal("corrupt".into()).close_code(), close::INTERNAL);
    }
}
