use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the monitoring loop.
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Interval between reconciliation passes over active jobs.
    pub poll_interval: Duration,
    /// Priority used for bulk monitoring calls on the worker pool.
    /// Lower values are serviced first.
    pub priority: u8,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            priority: 5,
        }
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks executing backend operations.
    pub workers: usize,
    /// Hard cap on a single backend operation. A task exceeding it is
    /// reported to its failure callback as timed out.
    pub task_timeout: Duration,
    /// How long a worker waits on an empty queue before re-checking the
    /// cancellation token.
    pub dequeue_poll: Duration,
    /// Grace period when joining workers during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_timeout: Duration::from_secs(300),
            dequeue_poll: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Configuration for the repository and coordinator checks.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Root directory holding job records, the index cache, and lock files.
    pub root: PathBuf,
    /// Bounded wait when acquiring a per-record lock.
    pub lock_timeout: Duration,
    /// Poll step while waiting for a contended lock.
    pub lock_poll: Duration,
    /// Coordinator disables all services when free space under `root`
    /// drops below this many bytes.
    pub min_free_bytes: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("jobmill-repo"),
            lock_timeout: Duration::from_secs(5),
            lock_poll: Duration::from_millis(50),
            min_free_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Top-level configuration for a jobmill session.
#[derive(Debug, Clone)]
pub struct MillConfig {
    pub repository: RepositoryConfig,
    pub pool: PoolConfig,
    pub monitoring: MonitoringConfig,
    /// Maximum number of explicit resubmits per job before it is left
    /// `failed` with the limit recorded.
    pub max_resubmits: u32,
}

impl Default for MillConfig {
    fn default() -> Self {
        Self {
            repository: RepositoryConfig::default(),
            pool: PoolConfig::default(),
            monitoring: MonitoringConfig::default(),
            max_resubmits: 5,
        }
    }
}

impl MillConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            repository: RepositoryConfig {
                root: root.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.monitoring.poll_interval = interval;
        self
    }

    pub fn with_max_resubmits(mut self, limit: u32) -> Self {
        self.max_resubmits = limit;
        self
    }

    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.repository.min_free_bytes = bytes;
        self
    }
}
