//! In-memory authoritative view over one repository.
//!
//! The registry owns id allocation, the master/subjob relationships, and
//! every mutating entry point (submit, resubmit, kill, remove). All
//! mutations follow the same critical section: acquire the record lock,
//! compute the next state on a draft, persist it, then commit the draft to
//! the arena — so concurrent writers to the same job never interleave
//! partial updates.

pub mod jobtree;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::BackendRegistry;
use crate::error::{MillError, Result};
use crate::model::{
    apply_transition, FqId, Job, JobId, JobStatus, LoadError, PluginRegistry, Transition,
};
use crate::repository::{FileRepository, IndexEntry};

pub use jobtree::JobTree;

struct RegistryInner {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
}

/// Registry-wide view over one repository.
pub struct Registry {
    repo: Arc<FileRepository>,
    backends: Arc<BackendRegistry>,
    plugins: Arc<PluginRegistry>,
    tree: JobTree,
    inner: RwLock<RegistryInner>,
    max_resubmits: u32,
}

impl Registry {
    pub fn new(
        repo: Arc<FileRepository>,
        plugins: Arc<PluginRegistry>,
        backends: Arc<BackendRegistry>,
        max_resubmits: u32,
    ) -> Self {
        Self {
            repo,
            backends,
            plugins,
            tree: JobTree::new(),
            inner: RwLock::new(RegistryInner {
                jobs: BTreeMap::new(),
                next_id: JobId::new(0),
            }),
            max_resubmits,
        }
    }

    pub fn repository(&self) -> &Arc<FileRepository> {
        &self.repo
    }

    /// Component schemas this registry resolves descriptors against.
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Organizational directory hierarchy over the registered jobs.
    pub fn tree(&self) -> &JobTree {
        &self.tree
    }

    /// Restore the arena from the repository. Corrupt records come back as
    /// placeholder stubs; their errors are returned with the owning job id
    /// prefixed, and loading continues for everything else.
    pub async fn load(&self) -> Result<Vec<LoadError>> {
        let mut errors = Vec::new();
        let mut inner = self.inner.write().await;
        inner.jobs.clear();
        for entry in self.repo.list_index().await {
            match self.repo.read(entry.id).await {
                Ok(loaded) => {
                    for e in loaded.errors {
                        errors.push(LoadError::new(
                            format!("jobs/{}/{}", entry.id, e.path),
                            e.reason,
                        ));
                    }
                    inner.jobs.insert(entry.id, loaded.value);
                }
                Err(e) => {
                    errors.push(LoadError::new(format!("jobs/{}", entry.id), e.to_string()));
                }
            }
        }
        inner.next_id = inner
            .jobs
            .keys()
            .max()
            .map(|id| id.next())
            .unwrap_or(JobId::new(0));
        tracing::info!(
            jobs = inner.jobs.len(),
            errors = errors.len(),
            "Registry loaded"
        );
        Ok(errors)
    }

    /// Register a new job: assign the next free id, stamp it `new`, and
    /// persist immediately. The id counter only moves under the registry
    /// write lock, so allocations never collide.
    ///
    /// The id is reserved in a short critical section before the record
    /// lock is taken; a stale lock file for the new id then stalls only
    /// this call, not every other registry operation. If the persist fails
    /// the reserved id is burned, which is harmless since ids are never
    /// reused anyway.
    pub async fn add(&self, mut job: Job) -> Result<JobId> {
        if self.repo.is_read_only() {
            return Err(MillError::ReadOnly("registry is read-only".into()));
        }
        let id = {
            let mut inner = self.inner.write().await;
            let id = inner.next_id;
            inner.next_id = id.next();
            id
        };
        job.id = id;
        job.relink_subjobs();
        let _lock = self.repo.lock(id).await?;
        self.repo.write(&job).await?;
        self.inner.write().await.jobs.insert(id, job);
        tracing::info!(job_id = %id, "Job registered");
        Ok(id)
    }

    pub async fn get(&self, id: JobId) -> Result<Job> {
        self.inner
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(MillError::JobNotFound(id))
    }

    pub async fn ids(&self) -> Vec<JobId> {
        self.inner.read().await.jobs.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }

    /// Fast listing from the repository's index cache; no record is
    /// deserialized.
    pub async fn list(&self) -> Vec<IndexEntry> {
        self.repo.list_index().await
    }

    /// Jobs the monitoring loop has to reconcile: non-terminal and at or
    /// past submission, or masters with such subjobs.
    pub async fn active_jobs(&self) -> Vec<Job> {
        self.inner
            .read()
            .await
            .jobs
            .values()
            .filter(|j| {
                j.status.needs_monitoring()
                    || j.subjobs.iter().any(|s| s.status.needs_monitoring())
            })
            .cloned()
            .collect()
    }

    /// Atomic read/modify/write on one job: record lock, draft mutation,
    /// persist, commit. If `f` fails or the write fails, the arena keeps
    /// the previous state.
    pub async fn update_with<R>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<R>,
    ) -> Result<R> {
        if self.repo.is_read_only() {
            return Err(MillError::ReadOnly("registry is read-only".into()));
        }
        let _lock = self.repo.lock(id).await?;
        let mut inner = self.inner.write().await;
        let mut draft = inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or(MillError::JobNotFound(id))?;
        let out = f(&mut draft)?;
        self.repo.write(&draft).await?;
        inner.jobs.insert(id, draft);
        Ok(out)
    }

    /// Remove a job from registry and repository. Only ever called
    /// explicitly; nothing removes jobs implicitly.
    pub async fn remove(&self, id: JobId) -> Result<Job> {
        if self.repo.is_read_only() {
            return Err(MillError::ReadOnly("registry is read-only".into()));
        }
        let _lock = self.repo.lock(id).await?;
        let mut inner = self.inner.write().await;
        let job = inner
            .jobs
            .remove(&id)
            .ok_or(MillError::JobNotFound(id))?;
        self.repo.delete(id).await?;
        let remaining: Vec<JobId> = inner.jobs.keys().copied().collect();
        drop(inner);
        self.tree.cleanlinks(&remaining).await;
        tracing::info!(job_id = %id, "Job removed");
        Ok(job)
    }

    /// Split a job into `count` subjobs cloned from the master's
    /// descriptors. Allowed only before submission.
    pub async fn split(&self, id: JobId, count: u32) -> Result<()> {
        self.update_with(id, |job| {
            if job.status != JobStatus::New {
                return Err(MillError::IllegalTransition {
                    id,
                    from: job.status.as_str(),
                    to: "split",
                });
            }
            job.subjobs = (0..count)
                .map(|i| {
                    let mut sub = Job::new(
                        format!("{}.{}", job.name, i),
                        job.application.clone(),
                        job.backend.clone(),
                    );
                    sub.id = JobId::new(i);
                    sub.master = Some(id);
                    sub
                })
                .collect();
            Ok(())
        })
        .await
    }

    /// Apply a status change to a job or subjob through the transition
    /// table. Illegal targets are rejected (logged, state unchanged) and
    /// reported as such; masters recompute their aggregate afterwards.
    pub async fn apply_status(
        &self,
        fqid: FqId,
        target: JobStatus,
        runtime: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Transition> {
        self.update_with(fqid.master, |job| {
            let slot = match fqid.subjob {
                Some(index) => job
                    .subjobs
                    .iter_mut()
                    .find(|s| s.id.value() == index)
                    .ok_or(MillError::JobNotFound(JobId::new(index)))?,
                None => job,
            };
            let transition = apply_transition(slot.id, slot.status, target);
            if transition.is_applied() {
                slot.force_status(target);
                if let Some(runtime) = runtime {
                    for (name, value) in runtime {
                        slot.backend.set_runtime(name, value);
                    }
                }
            }
            if fqid.subjob.is_some() {
                job.recompute_status();
            }
            Ok(transition)
        })
        .await
    }

    /// Recompute a master's cached aggregate status from its subjobs.
    pub async fn recompute_master_status(&self, id: JobId) -> Result<JobStatus> {
        self.update_with(id, |job| Ok(job.recompute_status())).await
    }

    fn backend_for(&self, job: &Job) -> Result<Arc<dyn crate::backend::Backend>> {
        self.backends
            .get(&job.backend.type_name)
            .ok_or_else(|| MillError::UnknownPlugin {
                category: "backends".into(),
                type_name: job.backend.type_name.clone(),
            })
    }

    /// Submit a job. Atomic jobs raise on backend failure (after recording
    /// `failed`); masters run an emulated bulk submission over their
    /// subjobs that keeps going past per-subjob failures and reports an
    /// aggregate incomplete-submission error naming exactly which subjobs
    /// failed.
    pub async fn submit(&self, id: JobId) -> Result<()> {
        let job = self.get(id).await?;
        if !job.status.can_transition(JobStatus::Submitting) {
            return Err(MillError::IllegalTransition {
                id,
                from: job.status.as_str(),
                to: JobStatus::Submitting.as_str(),
            });
        }
        let backend = self.backend_for(&job)?;

        // Mark the whole tree submitting before any backend call.
        self.update_with(id, |job| {
            job.force_status(JobStatus::Submitting);
            for sub in &mut job.subjobs {
                sub.force_status(JobStatus::Submitting);
            }
            Ok(())
        })
        .await?;

        if job.subjobs.is_empty() {
            return self.submit_atomic(id, backend).await;
        }
        self.submit_bulk(id, backend).await
    }

    async fn submit_atomic(
        &self,
        id: JobId,
        backend: Arc<dyn crate::backend::Backend>,
    ) -> Result<()> {
        let snapshot = self.get(id).await?;
        match backend.submit(&snapshot).await {
            Ok(spec) => {
                self.update_with(id, |job| {
                    job.backend = spec;
                    job.force_status(JobStatus::Submitted);
                    Ok(())
                })
                .await?;
                tracing::info!(job_id = %id, backend = backend.name(), "Job submitted");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.update_with(id, |job| {
                    job.force_status(JobStatus::Failed);
                    job.fail_reason = Some(reason.clone());
                    Ok(())
                })
                .await?;
                Err(e)
            }
        }
    }

    /// Emulated bulk submission: one backend call per subjob currently in
    /// `submitting`. A full submit marks the whole tree first; a resubmit
    /// marks only the recoverable subjobs, so anything else (a completed
    /// subjob in a partially failed master, say) is never re-submitted.
    async fn submit_bulk(
        &self,
        id: JobId,
        backend: Arc<dyn crate::backend::Backend>,
    ) -> Result<()> {
        let master = self.get(id).await?;
        let pending: Vec<&Job> = master
            .subjobs
            .iter()
            .filter(|s| s.status == JobStatus::Submitting)
            .collect();
        let total = pending.len();
        let mut failed = Vec::new();

        for sub in pending {
            let outcome = backend.submit(sub).await;
            let index = sub.id.value();
            self.update_with(id, |job| {
                let slot = job
                    .subjobs
                    .iter_mut()
                    .find(|s| s.id.value() == index)
                    .ok_or(MillError::JobNotFound(JobId::new(index)))?;
                match &outcome {
                    Ok(spec) => {
                        slot.backend = spec.clone();
                        slot.force_status(JobStatus::Submitted);
                    }
                    Err(e) => {
                        slot.force_status(JobStatus::Failed);
                        slot.fail_reason = Some(e.to_string());
                    }
                }
                Ok(())
            })
            .await?;
            if let Err(e) = outcome {
                tracing::warn!(job_id = %FqId::subjob(id, index), error = %e, "Subjob submission failed");
                failed.push((index, e.to_string()));
            }
        }

        self.recompute_master_status(id).await?;

        if failed.is_empty() {
            tracing::info!(job_id = %id, subjobs = total, backend = backend.name(), "Bulk submission complete");
            Ok(())
        } else {
            let details = failed
                .iter()
                .map(|(i, e)| format!("{id}.{i}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            Err(MillError::IncompleteSubmission {
                id,
                failed: failed.len(),
                total,
                details,
            })
        }
    }

    /// Explicit resubmit of a failed or killed job. Enforces the
    /// configured limit; once exceeded the job stays `failed` with the
    /// limit recorded in its failure reason.
    pub async fn resubmit(&self, id: JobId) -> Result<()> {
        let job = self.get(id).await?;
        if !job.status.can_transition(JobStatus::Submitting) {
            return Err(MillError::IllegalTransition {
                id,
                from: job.status.as_str(),
                to: JobStatus::Submitting.as_str(),
            });
        }
        if job.resubmit_count >= self.max_resubmits {
            let limit = self.max_resubmits;
            self.update_with(id, |job| {
                job.fail_reason = Some(format!("resubmit limit ({limit}) reached"));
                Ok(())
            })
            .await?;
            return Err(MillError::ResubmitLimit { id, limit });
        }
        let backend = self.backend_for(&job)?;

        // Only subjobs that may legally re-enter `submitting` (failed,
        // killed) are recycled; completed subjobs keep their status and
        // their backend runtime fields.
        self.update_with(id, |job| {
            job.reset_backend_identity();
            job.resubmit_count += 1;
            job.force_status(JobStatus::Submitting);
            for sub in &mut job.subjobs {
                if sub.status.can_transition(JobStatus::Submitting) {
                    sub.reset_backend_identity();
                    sub.force_status(JobStatus::Submitting);
                }
            }
            Ok(())
        })
        .await?;

        let snapshot = self.get(id).await?;
        if snapshot.subjobs.is_empty() {
            let outcome = backend.resubmit(&snapshot).await;
            match outcome {
                Ok(spec) => {
                    self.update_with(id, |job| {
                        job.backend = spec;
                        job.force_status(JobStatus::Submitted);
                        Ok(())
                    })
                    .await?;
                    tracing::info!(job_id = %id, attempt = snapshot.resubmit_count, "Job resubmitted");
                    Ok(())
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.update_with(id, |job| {
                        job.force_status(JobStatus::Failed);
                        job.fail_reason = Some(reason.clone());
                        Ok(())
                    })
                    .await?;
                    Err(e)
                }
            }
        } else {
            self.submit_bulk(id, backend).await
        }
    }

    /// Kill a job (and its subjobs). Safe to race with an in-flight
    /// monitoring update: once `killed` is recorded, a stale `running`
    /// report is rejected by the transition table.
    pub async fn kill(&self, id: JobId) -> Result<()> {
        let job = self.get(id).await?;
        if !job.status.can_transition(JobStatus::Killed) {
            return Err(MillError::IllegalTransition {
                id,
                from: job.status.as_str(),
                to: JobStatus::Killed.as_str(),
            });
        }
        let backend = self.backend_for(&job)?;

        if job.subjobs.is_empty() {
            backend.kill(&job).await?;
        } else {
            for sub in &job.subjobs {
                if !sub.status.is_terminal() {
                    backend.kill(sub).await?;
                }
            }
        }

        self.update_with(id, |job| {
            for sub in &mut job.subjobs {
                if sub.status.can_transition(JobStatus::Killed) {
                    sub.force_status(JobStatus::Killed);
                }
            }
            if job.subjobs.is_empty() {
                job.force_status(JobStatus::Killed);
            } else {
                job.recompute_status();
            }
            Ok(())
        })
        .await?;
        tracing::info!(job_id = %id, "Job killed");
        Ok(())
    }
}
