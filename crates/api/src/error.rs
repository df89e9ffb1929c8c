use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use trace::ValidationError;

/// Superset error type for the HTTP surface. Converts the other crates'
/// errors and maps every variant to the status codes in spec.md §4.6/§7.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),

    /// Create-trace's `project_id` doesn't match the caller's key.
    #[error("forbidden")]
    Forbidden,

    /// Resource absent, or owned by a different project (spec.md §4.3:
    /// cross-project access is reported identically to absence).
    #[error("not found")]
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, e.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Storage(e) => {
                tracing::error!(error = %e, "storage backend failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(trace::dto::ErrorResponse::new(detail))).into_response()
    }
}
