use thiserror::Error;

use crate::model::JobId;

#[derive(Error, Debug)]
pub enum MillError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Attribute '{attribute}' of job {id} is protected after submission")]
    AttributeProtected { id: JobId, attribute: String },

    #[error("Illegal status transition for job {id}: {from} -> {to}")]
    IllegalTransition {
        id: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Repository is read-only: {0}")]
    ReadOnly(String),

    #[error("Timed out waiting for lock on record {id} after {waited_ms} ms")]
    LockTimeout { id: JobId, waited_ms: u64 },

    #[error("Unknown plugin '{type_name}' in category '{category}'")]
    UnknownPlugin { category: String, type_name: String },

    #[error("Backend '{backend}' error: {message}")]
    Backend { backend: String, message: String },

    #[error("{failed} of {total} subjobs of job {id} failed to submit: {details}")]
    IncompleteSubmission {
        id: JobId,
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("Resubmit limit ({limit}) reached for job {id}")]
    ResubmitLimit { id: JobId, limit: u32 },

    #[error("Worker pool is frozen, submission rejected")]
    PoolFrozen,

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Operation timed out after {0} ms")]
    OperationTimeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MillError {
    /// Whether the caller may retry without any prior state change. Lock
    /// contention, operation timeouts, and transport-level backend failures
    /// qualify; everything else needs a decision from the caller first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MillError::LockTimeout { .. }
                | MillError::OperationTimeout(_)
                | MillError::Backend { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MillError>;
