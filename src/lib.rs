pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod monitor;
pub mod pool;
pub mod registry;
pub mod repository;
pub mod shutdown;

pub use backend::{Backend, BackendRegistry, LocalBackend, MonitoringReport};
pub use config::MillConfig;
pub use coordinator::{Coordinator, CredentialCheck, DisableReason};
pub use error::{MillError, Result};
pub use model::{Job, JobId, JobStatus};
pub use monitor::MonitoringLoop;
pub use pool::WorkerPool;
pub use registry::Registry;
pub use repository::FileRepository;
