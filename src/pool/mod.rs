//! Generic priority worker pool for potentially-blocking backend
//! operations.
//!
//! Callers enqueue an operation future plus success/failure callbacks and
//! return immediately; a fixed set of worker tasks executes the queue in
//! (priority, submission) order. The pool guarantees at-most-one execution
//! per element and reliable callback delivery: operation panics, callback
//! panics, and per-task timeouts are caught and routed, never allowed to
//! kill a worker.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::{MillError, Result};

type WorkUnit = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A queued unit of work. Owned exclusively by the pool from enqueue to
/// completion; callbacks are baked into the erased future at submission.
struct QueueElement {
    priority: u8,
    seq: u64,
    unit: WorkUnit,
}

impl PartialEq for QueueElement {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueElement {}

impl PartialOrd for QueueElement {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueElement {
    // BinaryHeap is a max-heap; invert so the lowest (priority, seq) pops
    // first: lower priority value wins, FIFO within a priority.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<QueueElement>>,
    notify: Notify,
    seq: AtomicU64,
    frozen: AtomicBool,
    shut_down: AtomicBool,
}

/// Fixed-size pool of worker tasks fed by a priority queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
    task_timeout: Duration,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });
        let token = CancellationToken::new();

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                shared.clone(),
                token.clone(),
                config.dequeue_poll,
            )));
        }

        Self {
            shared,
            workers: Mutex::new(workers),
            token,
            task_timeout: config.task_timeout,
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Enqueue an operation with its callbacks. Lower `priority` values are
    /// serviced first; equal priorities run in submission order. Returns
    /// without blocking beyond the queue insertion.
    pub fn submit<T, F, S, E>(&self, priority: u8, operation: F, on_success: S, on_failure: E) -> Result<()>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(MillError) + Send + 'static,
    {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(MillError::PoolShutdown);
        }
        if self.shared.frozen.load(Ordering::SeqCst) {
            return Err(MillError::PoolFrozen);
        }

        let timeout = self.task_timeout;
        let unit: WorkUnit = Box::pin(async move {
            let outcome =
                match tokio::time::timeout(timeout, AssertUnwindSafe(operation).catch_unwind())
                    .await
                {
                    Err(_) => Err(MillError::OperationTimeout(timeout.as_millis() as u64)),
                    Ok(Err(panic)) => Err(MillError::Internal(format!(
                        "operation panicked: {}",
                        panic_message(&panic)
                    ))),
                    Ok(Ok(result)) => result,
                };
            let callback = match outcome {
                Ok(value) => std::panic::catch_unwind(AssertUnwindSafe(move || on_success(value))),
                Err(error) => std::panic::catch_unwind(AssertUnwindSafe(move || on_failure(error))),
            };
            if let Err(panic) = callback {
                tracing::error!(
                    reason = %panic_message(&panic),
                    "Task callback panicked; worker continues"
                );
            }
        });

        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
        self.shared
            .queue
            .lock()
            .expect("pool queue mutex poisoned")
            .push(QueueElement {
                priority,
                seq,
                unit,
            });
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Reject new submissions without dropping queued work. Used by the
    /// coordinator during credential loss or disk exhaustion.
    pub fn freeze(&self) {
        self.shared.frozen.store(true, Ordering::SeqCst);
        tracing::info!("Worker pool frozen");
    }

    pub fn unfreeze(&self) {
        self.shared.frozen.store(false, Ordering::SeqCst);
        tracing::info!("Worker pool unfrozen");
    }

    pub fn is_frozen(&self) -> bool {
        self.shared.frozen.load(Ordering::SeqCst)
    }

    /// Number of queued (not yet started) elements.
    pub fn pending(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("pool queue mutex poisoned")
            .len()
    }

    /// Drop all queued elements without executing them. Returns how many
    /// were discarded; their callbacks never fire.
    pub fn drain(&self) -> usize {
        let mut queue = self
            .shared
            .queue
            .lock()
            .expect("pool queue mutex poisoned");
        let dropped = queue.len();
        queue.clear();
        if dropped > 0 {
            tracing::info!(dropped, "Drained unexecuted queue elements");
        }
        dropped
    }

    /// Signal workers to stop after their current unit and join them with a
    /// bounded grace period. Queued-but-unstarted elements are discarded.
    pub async fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        self.token.cancel();
        self.shared.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("pool workers mutex poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(self.shutdown_grace, handle).await.is_err() {
                tracing::warn!("Worker did not stop within the grace period");
            }
        }
        let dropped = self.drain();
        tracing::info!(dropped, "Worker pool shut down");
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<PoolShared>,
    token: CancellationToken,
    dequeue_poll: Duration,
) {
    tracing::debug!(worker_id, "Pool worker started");
    loop {
        if token.is_cancelled() {
            break;
        }
        let element = shared
            .queue
            .lock()
            .expect("pool queue mutex poisoned")
            .pop();
        match element {
            Some(element) => {
                tracing::trace!(worker_id, priority = element.priority, seq = element.seq, "Executing element");
                element.unit.await;
            }
            None => {
                // Bounded wait so cancellation is observed promptly even
                // when no work ever arrives.
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::timeout(dequeue_poll, shared.notify.notified()) => {}
                }
            }
        }
    }
    tracing::debug!(worker_id, "Pool worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
