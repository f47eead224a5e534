//! Durable storage of job records.
//!
//! - [`serializer`]: job <-> versioned document conversion with tolerant,
//!   error-accumulating reconstruction
//! - [`store`]: the file-backed repository (atomic writes, per-record
//!   lock files, index cache)

pub mod serializer;
pub mod store;

pub use store::{FileRepository, IndexEntry, RecordLock};
