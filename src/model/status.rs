use serde::{Deserialize, Serialize};

use crate::model::job::JobId;

/// Lifecycle status of a job.
///
/// The canonical success path is `new -> submitting -> submitted -> running
/// -> completing -> completed`. `paused` is a user hold entered from
/// `submitted`/`running`. `running/pause` is synthesized for master jobs
/// whose subjobs mix running and paused states; it is never a legal
/// transition target for an atomic job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Submitting,
    Submitted,
    Running,
    Paused,
    Completing,
    Completed,
    Failed,
    Killed,
    #[serde(rename = "running/pause")]
    RunningPaused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Submitting => "submitting",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completing => "completing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::RunningPaused => "running/pause",
        }
    }

    /// Position on the canonical success chain, if the status is on it.
    fn chain_index(&self) -> Option<u8> {
        match self {
            JobStatus::New => Some(0),
            JobStatus::Submitting => Some(1),
            JobStatus::Submitted => Some(2),
            JobStatus::Running => Some(3),
            JobStatus::Completing => Some(4),
            JobStatus::Completed => Some(5),
            _ => None,
        }
    }

    /// Terminal statuses never leave on their own; only an explicit
    /// resubmit moves `failed`/`killed` back to `submitting`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed
        )
    }

    /// Statuses the monitoring loop has to reconcile with the backend.
    pub fn needs_monitoring(&self) -> bool {
        matches!(
            self,
            JobStatus::Submitting
                | JobStatus::Submitted
                | JobStatus::Running
                | JobStatus::Completing
                | JobStatus::RunningPaused
        )
    }

    /// Whether `target` is reachable from `self` in one step.
    ///
    /// Forward jumps along the canonical chain are legal from `submitting`
    /// onward (a backend may report `completed` while we still hold
    /// `submitted`). Backward moves are not, which is what rejects stale
    /// monitoring updates arriving after a kill or completion.
    pub fn can_transition(&self, target: JobStatus) -> bool {
        if *self == target {
            return false;
        }
        // The composite is written only by aggregate recomputation.
        if target == JobStatus::RunningPaused {
            return false;
        }
        match (*self, target) {
            (JobStatus::New, JobStatus::Submitting) => true,
            (JobStatus::New, _) => false,
            (from, JobStatus::Failed) | (from, JobStatus::Killed) => !from.is_terminal(),
            (JobStatus::Submitted, JobStatus::Paused) | (JobStatus::Running, JobStatus::Paused) => {
                true
            }
            (JobStatus::Paused, JobStatus::Running) => true,
            (JobStatus::Failed, JobStatus::Submitting)
            | (JobStatus::Killed, JobStatus::Submitting) => true,
            (JobStatus::RunningPaused, JobStatus::Running)
            | (JobStatus::RunningPaused, JobStatus::Paused)
            | (JobStatus::RunningPaused, JobStatus::Completing)
            | (JobStatus::RunningPaused, JobStatus::Completed) => true,
            (from, to) => match (from.chain_index(), to.chain_index()) {
                (Some(f), Some(t)) => t > f,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of applying a status change through the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The change was legal and should be persisted.
    Applied { from: JobStatus, to: JobStatus },
    /// Target equals current status; nothing to do.
    Unchanged,
    /// Target is not reachable; state is left as-is. Stale monitoring
    /// results land here.
    Rejected { from: JobStatus, to: JobStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Validate a status change for `id`. Rejections are logged as warnings,
/// never raised, so one stale update cannot abort a monitoring batch.
pub fn apply_transition(id: JobId, current: JobStatus, target: JobStatus) -> Transition {
    if current == target {
        return Transition::Unchanged;
    }
    if current.can_transition(target) {
        Transition::Applied {
            from: current,
            to: target,
        }
    } else {
        tracing::warn!(
            job_id = %id,
            from = %current,
            to = %target,
            "Rejected illegal status transition"
        );
        Transition::Rejected {
            from: current,
            to: target,
        }
    }
}

/// Compute a master job's status from its subjobs.
///
/// Canonical precedence (first match wins):
/// 1. no subjobs: the job's own status
/// 2. all completed: `completed`
/// 3. all terminal with at least one `failed`/`killed`: `failed`
/// 4. paused subjobs alongside in-flight ones: `running/pause`
/// 5. every non-terminal subjob paused: `paused`
/// 6. any subjob still `new`/`submitting`: `submitting`
/// 7. otherwise: `running`
///
/// Pure and idempotent; callers store the result only as a refreshable
/// cache, never as ground truth.
pub fn aggregate_status(own: JobStatus, subjobs: &[JobStatus]) -> JobStatus {
    if subjobs.is_empty() {
        return own;
    }
    if subjobs.iter().all(|s| *s == JobStatus::Completed) {
        return JobStatus::Completed;
    }
    if subjobs.iter().all(|s| s.is_terminal()) {
        return JobStatus::Failed;
    }
    let any_paused = subjobs.iter().any(|s| *s == JobStatus::Paused);
    let any_in_flight = subjobs.iter().any(|s| {
        matches!(
            s,
            JobStatus::Submitting
                | JobStatus::Submitted
                | JobStatus::Running
                | JobStatus::Completing
                | JobStatus::RunningPaused
        )
    });
    if any_paused && any_in_flight {
        return JobStatus::RunningPaused;
    }
    if any_paused && !any_in_flight {
        return JobStatus::Paused;
    }
    if subjobs
        .iter()
        .any(|s| matches!(s, JobStatus::New | JobStatus::Submitting))
    {
        return JobStatus::Submitting;
    }
    JobStatus::Running
}
