//! Versioned object model for jobs and their polymorphic components.
//!
//! - [`job`]: the `Job` entity (master/subjob trees, protected attributes)
//! - [`status`]: the job state machine and master-status aggregation
//! - [`document`]: the persisted record envelope and schema versioning
//! - [`plugin`]: the open `(category, type tag)` component registry

pub mod document;
pub mod job;
pub mod plugin;
pub mod status;

pub use document::{Document, LoadError, LoadResult, SchemaVersion};
pub use job::{FileRef, FqId, Job, JobId};
pub use plugin::{ComponentSpec, PluginDescriptor, PluginRegistry};
pub use status::{aggregate_status, apply_transition, JobStatus, Transition};
