use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MillError, Result};
use crate::model::plugin::ComponentSpec;
use crate::model::status::{aggregate_status, JobStatus};

/// Registry-scoped job identifier. Assigned once by the registry and
/// immutable afterwards. Subjobs reuse the master's id and are addressed
/// by `FqId`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct JobId(u32);

impl JobId {
    pub fn new(id: u32) -> Self {
        JobId(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> JobId {
        JobId(self.0 + 1)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully-qualified id: `<master>` for a top-level job, `<master>.<index>`
/// for a subjob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FqId {
    pub master: JobId,
    pub subjob: Option<u32>,
}

impl FqId {
    pub fn master(id: JobId) -> Self {
        Self {
            master: id,
            subjob: None,
        }
    }

    pub fn subjob(id: JobId, index: u32) -> Self {
        Self {
            master: id,
            subjob: Some(index),
        }
    }
}

impl std::fmt::Display for FqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.subjob {
            Some(i) => write!(f, "{}.{}", self.master, i),
            None => write!(f, "{}", self.master),
        }
    }
}

/// A file attached to a job sandbox, by name pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub pattern: String,
}

impl FileRef {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

/// The central entity: a unit of work bound to an application descriptor
/// and a backend descriptor, optionally split into subjobs.
///
/// Ownership is strictly top-down. A master owns its `subjobs` inline; a
/// subjob's `master` field is a weak id back-reference resolved through the
/// registry and is not serialized (the serializer rebuilds it on load, which
/// keeps persisted documents tree-shaped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub application: ComponentSpec,
    pub backend: ComponentSpec,
    #[serde(default)]
    pub inputfiles: Vec<FileRef>,
    #[serde(default)]
    pub outputfiles: Vec<FileRef>,
    #[serde(default)]
    pub subjobs: Vec<Job>,
    /// Weak back-reference; rebuilt on load, never persisted.
    #[serde(skip)]
    pub master: Option<JobId>,
    /// Status name -> timestamp of the transition into it.
    #[serde(default)]
    pub time: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub resubmit_count: u32,
    #[serde(default)]
    pub fail_reason: Option<String>,
}

impl Job {
    pub fn new(name: impl Into<String>, application: ComponentSpec, backend: ComponentSpec) -> Self {
        let mut job = Self {
            id: JobId::default(),
            name: name.into(),
            status: JobStatus::New,
            application,
            backend,
            inputfiles: Vec::new(),
            outputfiles: Vec::new(),
            subjobs: Vec::new(),
            master: None,
            time: BTreeMap::new(),
            resubmit_count: 0,
            fail_reason: None,
        };
        job.record_status_time(JobStatus::New);
        job
    }

    pub fn is_master(&self) -> bool {
        !self.subjobs.is_empty()
    }

    pub fn fqid(&self) -> FqId {
        match self.master {
            Some(master) => {
                // A subjob's index within its master is positional.
                FqId::subjob(master, self.id.value())
            }
            None => FqId::master(self.id),
        }
    }

    /// Set the status directly and stamp the transition time. Legality is
    /// the state machine's concern; the registry goes through
    /// `apply_transition` before calling this.
    pub fn force_status(&mut self, status: JobStatus) {
        self.status = status;
        self.record_status_time(status);
    }

    fn record_status_time(&mut self, status: JobStatus) {
        self.time.insert(status.as_str().to_string(), Utc::now());
    }

    /// Recompute the cached aggregate status from the subjobs. Returns the
    /// new value; pure apart from refreshing the cache and the time stamp.
    pub fn recompute_status(&mut self) -> JobStatus {
        let subs: Vec<JobStatus> = self.subjobs.iter().map(|s| s.status).collect();
        let next = aggregate_status(self.status, &subs);
        if next != self.status {
            self.force_status(next);
        }
        next
    }

    /// Attributes describing what/where to run are frozen from the moment
    /// submission starts.
    pub fn check_writable(&self, attribute: &str) -> Result<()> {
        if self.status == JobStatus::New {
            Ok(())
        } else {
            Err(MillError::AttributeProtected {
                id: self.id,
                attribute: attribute.to_string(),
            })
        }
    }

    pub fn set_application(&mut self, application: ComponentSpec) -> Result<()> {
        self.check_writable("application")?;
        self.application = application;
        Ok(())
    }

    pub fn set_backend(&mut self, backend: ComponentSpec) -> Result<()> {
        self.check_writable("backend")?;
        self.backend = backend;
        Ok(())
    }

    pub fn set_inputfiles(&mut self, files: Vec<FileRef>) -> Result<()> {
        self.check_writable("inputfiles")?;
        self.inputfiles = files;
        Ok(())
    }

    /// Drop backend-identifying fields before a resubmit so the new
    /// submission starts from a clean descriptor. Shallow: subjobs keep
    /// their runtime fields (a completed subjob's external id and exit
    /// code must survive a master resubmit), the caller resets exactly the
    /// subjobs it is about to resubmit.
    pub fn reset_backend_identity(&mut self) {
        self.backend.reset_runtime_fields();
        self.fail_reason = None;
    }

    /// Restore weak master references after deserialization.
    pub fn relink_subjobs(&mut self) {
        let master = self.id;
        for sub in &mut self.subjobs {
            sub.master = Some(master);
            sub.relink_subjobs();
        }
    }
}
