use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Authentication/authorization failures, mapped to HTTP status per
/// spec.md §4.3/§7. Cross-project ownership mismatches are not modeled
/// here — those are decided by the `api` crate once a resource is loaded,
/// since the 403-vs-404 split depends on which operation is being performed.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing API key")]
    MissingKey,

    #[error("malformed API key")]
    InvalidFormat,

    #[error("unknown API key")]
    UnknownKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingKey | AuthError::UnknownKey => StatusCode::UNAUTHORIZED,
            AuthError::InvalidFormat => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}
