use thiserror::Error;

/// Entity validation failures. Every variant names the offending field so
/// the HTTP layer can surface a structured `{detail}` body (see `api::ApiError`).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max} characters")]
    LengthOutOfRange {
        field: &'static str,
        min: usize,
        max: usize,
    },

    #[error("{field} must match ^[A-Za-z0-9_-]+$")]
    InvalidCharacters { field: &'static str },

    #[error("{field} must not be negative")]
    Negative { field: &'static str },

    #[error("tags list must not exceed {max} items")]
    TooManyTags { max: usize },

    #[error("unknown span_type '{0}'")]
    UnknownSpanKind(String),

    #[error("end_time must not precede start_time")]
    EndBeforeStart,

    #[error("{field} is required")]
    Missing { field: &'static str },
}
