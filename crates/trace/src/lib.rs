//! Entity model, request/response schemas, validation, and the size-guard
//! truncation pipeline shared by every other crate in the workspace.

pub mod dto;
pub mod error;
pub mod model;
pub mod sizeguard;
pub mod validate;

pub use error::ValidationError;
pub use model::{Span, SpanId, SpanKind, Trace, TraceId};
