//! Periodic reconciliation of local job state with backend-reported state.
//!
//! Every poll interval the loop partitions active jobs by backend type and
//! issues one bulk `update_monitoring_information` call per group through
//! the worker pool. Results flow through the transition table (stale
//! updates rejected per job, never aborting the batch) and changed jobs
//! are persisted; masters recompute their aggregate afterwards. Transport
//! failures are logged and retried on the next cycle.
//!
//! Bulk calls are single-flight per backend: a group whose previous call
//! has not returned is skipped for the cycle, so two operations covering
//! the same job never run concurrently on different workers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendRegistry, MonitorSnapshot};
use crate::config::MonitoringConfig;
use crate::coordinator::Coordinator;
use crate::error::{MillError, Result};
use crate::model::FqId;
use crate::pool::WorkerPool;
use crate::registry::Registry;

pub struct MonitoringLoop {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    backends: Arc<BackendRegistry>,
    coordinator: Arc<Coordinator>,
    config: MonitoringConfig,
    /// Backend groups with a bulk call still on the pool.
    in_flight: Arc<StdMutex<HashSet<String>>>,
    token: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitoringLoop {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        backends: Arc<BackendRegistry>,
        coordinator: Arc<Coordinator>,
        config: MonitoringConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            backends,
            coordinator,
            config,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            token: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Start the periodic driver. A second start while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle_slot = self.handle.lock().await;
        if handle_slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let token = CancellationToken::new();
        *self.token.lock().await = Some(token.clone());
        // A pool shutdown discards queued calls without callbacks; start
        // from a clean slate so a stale flag cannot pin a group.
        self.in_flight
            .lock()
            .expect("in-flight set lock poisoned")
            .clear();

        let this = Arc::clone(self);
        *handle_slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval = ?this.config.poll_interval, "Monitoring loop started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        this.coordinator.check_resources();
                        if !this.coordinator.is_enabled() {
                            tracing::debug!("Services disabled, skipping monitoring cycle");
                            continue;
                        }
                        if let Err(e) = this.run_cycle().await {
                            tracing::warn!(error = %e, "Monitoring cycle failed");
                        }
                    }
                }
            }
            tracing::info!("Monitoring loop stopped");
        }));
    }

    /// Stop the driver and wait for it to exit. In-flight bulk calls on
    /// the pool complete on their own; a later `start` resumes cleanly.
    pub async fn stop(&self) {
        if let Some(token) = self.token.lock().await.take() {
            token.cancel();
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// One reconciliation pass: group active jobs by backend and enqueue a
    /// bulk monitoring call per group. Returns the number of bulk calls
    /// enqueued. Application of the results happens on the pool workers.
    pub async fn run_cycle(&self) -> Result<usize> {
        let jobs = self.registry.active_jobs().await;
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut groups: HashMap<String, Vec<MonitorSnapshot>> = HashMap::new();
        for job in &jobs {
            if job.subjobs.is_empty() {
                if job.status.needs_monitoring() {
                    groups
                        .entry(job.backend.type_name.clone())
                        .or_default()
                        .push(MonitorSnapshot {
                            id: FqId::master(job.id),
                            status: job.status,
                            backend: job.backend.clone(),
                        });
                }
            } else {
                // Subjobs may run on a different backend than the master;
                // group them by their own descriptor.
                for sub in &job.subjobs {
                    if sub.status.needs_monitoring() {
                        groups
                            .entry(sub.backend.type_name.clone())
                            .or_default()
                            .push(MonitorSnapshot {
                                id: FqId::subjob(job.id, sub.id.value()),
                                status: sub.status,
                                backend: sub.backend.clone(),
                            });
                    }
                }
            }
        }

        let mut enqueued = 0;
        for (backend_name, snapshots) in groups {
            let Some(backend) = self.backends.get(&backend_name) else {
                tracing::warn!(backend = %backend_name, "No adapter registered, jobs left unmonitored");
                continue;
            };
            {
                let mut busy = self.in_flight.lock().expect("in-flight set lock poisoned");
                if !busy.insert(backend_name.clone()) {
                    tracing::debug!(backend = %backend_name, "Previous bulk call still running, group skipped");
                    continue;
                }
            }
            let registry = Arc::clone(&self.registry);
            let count = snapshots.len();
            let operation = async move {
                let report = backend.update_monitoring_information(&snapshots).await;
                let mut applied = 0usize;
                for (fqid, update) in report.updates {
                    match registry
                        .apply_status(fqid, update.status, Some(update.runtime))
                        .await
                    {
                        Ok(transition) if transition.is_applied() => applied += 1,
                        Ok(_) => {}
                        Err(e) if e.is_retryable() => {
                            tracing::debug!(job_id = %fqid, error = %e, "Deferred monitoring update, retrying next cycle");
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %fqid, error = %e, "Failed to apply monitoring update");
                        }
                    }
                }
                for (fqid, reason) in report.failures {
                    tracing::debug!(job_id = %fqid, reason = %reason, "Transient monitoring failure, retrying next cycle");
                }
                Ok(applied)
            };
            let name_ok = backend_name.clone();
            let name_err = backend_name.clone();
            let busy_ok = Arc::clone(&self.in_flight);
            let busy_err = Arc::clone(&self.in_flight);
            // The pool fires exactly one callback per element, including on
            // timeout and panic, so the flag cannot leak.
            match self.pool.submit(
                self.config.priority,
                operation,
                move |applied| {
                    busy_ok
                        .lock()
                        .expect("in-flight set lock poisoned")
                        .remove(&name_ok);
                    tracing::debug!(backend = %name_ok, applied, "Bulk monitoring call applied");
                },
                move |e: MillError| {
                    busy_err
                        .lock()
                        .expect("in-flight set lock poisoned")
                        .remove(&name_err);
                    tracing::warn!(backend = %name_err, error = %e, "Bulk monitoring call failed");
                },
            ) {
                Ok(()) => {
                    tracing::trace!(jobs = count, "Bulk monitoring call enqueued");
                    enqueued += 1;
                }
                Err(MillError::PoolFrozen) | Err(MillError::PoolShutdown) => {
                    self.in_flight
                        .lock()
                        .expect("in-flight set lock poisoned")
                        .remove(&backend_name);
                    tracing::debug!("Pool not accepting work, cycle abandoned");
                    break;
                }
                Err(e) => {
                    self.in_flight
                        .lock()
                        .expect("in-flight set lock poisoned")
                        .remove(&backend_name);
                    return Err(e);
                }
            }
        }
        Ok(enqueued)
    }
}
