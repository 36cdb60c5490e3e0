/**
 * Error Conversion
 *
 * Conversions from dependency errors into `ServiceError` and from
 * `ServiceError` into HTTP responses.
 *
 * # Response Format
 *
 * Error responses use a small JSON envelope:
 * ```json
 * {
 *   "error": "not_found",
 *   "message": "not found: document 7f0c..."
 * }
 * ```
 */

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::engine::EngineError;
use crate::error::types::ServiceError;
use crate::storage::BlobError;

impl IntoResponse for ServiceError {
    /// Convert a service error into an HTTP response with the standard
    /// `{error, message}` envelope.
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from("Internal Server Error"))
                    .unwrap()
            })
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".into()),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<BlobError> for ServiceError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound => Self::NotFound("object not found".into()),
            BlobError::Transport(message) => Self::Transient(message),
            BlobError::AuthFailure(message) => Self::Fatal(message),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        // Undecodable persisted CRDT data is an invariant violation, not a
        // retryable condition.
        Self::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: ServiceError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn test_blob_errors_map_by_kind() {
        let err: ServiceError = BlobError::NotFound.into();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err: ServiceError = BlobError::Transport("timeout".into()).into();
        assert!(matches!(err, ServiceError::Transient(_)));

        let err: ServiceError = BlobError::AuthFailure("bad creds".into()).into();
        assert!(matches!(err, ServiceError::Fatal(_)));
    }

    #[test]
    fn test_engine_error_is_fatal() {
        let err: ServiceError = EngineError::Decode("truncated update".into()).into();
        assert!(matches!(err, ServiceError::Fatal(_)));
    }
}
