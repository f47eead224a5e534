use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::error::{MillError, Result};
use crate::model::{ComponentSpec, FqId, Job, JobStatus};

/// Per-job snapshot handed to a bulk monitoring call. Backends never see
/// the registry; they get exactly what they need to poll their middleware.
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub id: FqId,
    pub status: JobStatus,
    pub backend: ComponentSpec,
}

/// One reconciled job status coming back from a backend.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: JobStatus,
    /// Backend-assigned fields to merge into the job's backend runtime
    /// section (external id, exit code, worker node).
    pub runtime: Map<String, Value>,
}

impl StatusUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            runtime: Map::new(),
        }
    }

    pub fn with_runtime(mut self, name: impl Into<String>, value: Value) -> Self {
        self.runtime.insert(name.into(), value);
        self
    }
}

/// Result of a bulk monitoring call: a partial-failure map. Jobs absent
/// from both maps are unchanged; failures are transient and retried on the
/// next monitoring cycle, never escalated to a terminal status.
#[derive(Debug, Default)]
pub struct MonitoringReport {
    pub updates: HashMap<FqId, StatusUpdate>,
    pub failures: HashMap<FqId, String>,
}

impl MonitoringReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, id: FqId, update: StatusUpdate) {
        self.updates.insert(id, update);
    }

    pub fn failure(&mut self, id: FqId, reason: impl Into<String>) {
        self.failures.insert(id, reason.into());
    }
}

/// Contract every execution backend implements. Submission and kill return
/// explicit errors; monitoring reports per-job partial failures instead of
/// failing the whole bulk call.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand the job to the middleware. Returns the backend descriptor with
    /// its runtime section filled in (external id and friends).
    async fn submit(&self, job: &Job) -> Result<ComponentSpec>;

    /// Resubmission after a failure or kill. Backend-identifying fields
    /// have already been reset by the registry.
    async fn resubmit(&self, job: &Job) -> Result<ComponentSpec> {
        self.submit(job).await
    }

    async fn kill(&self, job: &Job) -> Result<()>;

    /// Bulk status poll covering every active job on this backend, to
    /// amortize round trips to slow middleware.
    async fn update_monitoring_information(&self, jobs: &[MonitorSnapshot]) -> MonitoringReport;
}

/// Lookup table from a backend descriptor's type tag to its adapter.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }
}

/// Reference adapter running jobs as local processes. The application
/// descriptor supplies `exe` and `args`; spawned children are tracked so
/// monitoring can reap their exit status.
pub struct LocalBackend {
    children: Mutex<HashMap<FqId, Child>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    fn command_for(job: &Job) -> Result<Command> {
        let exe = job
            .application
            .field_str("exe")
            .ok_or_else(|| MillError::Backend {
                backend: "Local".into(),
                message: format!("job {} has no 'exe' in its application", job.id),
            })?;
        let mut command = Command::new(exe);
        if let Some(args) = job.application.field("args").and_then(Value::as_array) {
            for arg in args {
                match arg {
                    Value::String(s) => command.arg(s),
                    other => command.arg(other.to_string()),
                };
            }
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        Ok(command)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "Local"
    }

    async fn submit(&self, job: &Job) -> Result<ComponentSpec> {
        let mut command = Self::command_for(job)?;
        let child = command.spawn().map_err(|e| MillError::Backend {
            backend: "Local".into(),
            message: format!("failed to spawn process: {e}"),
        })?;
        let mut spec = job.backend.clone();
        if let Some(pid) = child.id() {
            spec.set_runtime("pid", Value::from(pid));
        }
        tracing::info!(job_id = %job.fqid(), pid = ?child.id(), "Local process spawned");
        self.children.lock().await.insert(job.fqid(), child);
        Ok(spec)
    }

    async fn kill(&self, job: &Job) -> Result<()> {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&job.fqid()) {
            child.start_kill().map_err(|e| MillError::Backend {
                backend: "Local".into(),
                message: format!("kill failed: {e}"),
            })?;
        }
        Ok(())
    }

    async fn update_monitoring_information(&self, jobs: &[MonitorSnapshot]) -> MonitoringReport {
        let mut report = MonitoringReport::new();
        let mut children = self.children.lock().await;
        for snapshot in jobs {
            let Some(child) = children.get_mut(&snapshot.id) else {
                // Child handle lost (e.g. session restart); transient, the
                // user decides whether to resubmit.
                report.failure(snapshot.id, "no process handle for job");
                continue;
            };
            match child.try_wait() {
                Ok(None) => {
                    report.update(snapshot.id, StatusUpdate::status(JobStatus::Running));
                }
                Ok(Some(exit)) => {
                    let code = exit.code().unwrap_or(-1);
                    let status = if exit.success() {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    report.update(
                        snapshot.id,
                        StatusUpdate::status(status).with_runtime("exit_code", Value::from(code)),
                    );
                    children.remove(&snapshot.id);
                }
                Err(e) => {
                    report.failure(snapshot.id, format!("wait failed: {e}"));
                }
            }
        }
        report
    }
}
