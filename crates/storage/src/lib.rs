//! Storage abstraction layer: the `StorageBackend` trait, cursor encoding,
//! and post-query filter types. Concrete backends (currently `storage-sqlite`)
//! implement the trait against a real engine.

pub mod backend;
pub mod cursor;
pub mod error;
pub mod filter;

pub use backend::{StorageBackend, TracePage};
pub use cursor::PageToken;
pub use error::StorageError;
pub use filter::TraceListFilter;
