//! Process-wide service enablement.
//!
//! The coordinator owns the `services enabled` flag. It starts enabled,
//! gets disabled when a required credential lapses or free disk space
//! drops below the configured threshold, and is re-enabled only by an
//! explicit call that re-verifies the triggering condition. While
//! disabled, the repository is read-only and the worker pool is frozen, so
//! no write can happen with insufficient guarantees.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{MillError, Result};
use crate::pool::WorkerPool;
use crate::registry::Registry;

/// Why services were disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisableReason {
    CredentialInvalid(String),
    DiskSpaceLow { available: u64, required: u64 },
    Manual(String),
}

impl std::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisableReason::CredentialInvalid(c) => write!(f, "credential invalid: {c}"),
            DisableReason::DiskSpaceLow {
                available,
                required,
            } => write!(
                f,
                "free disk space {available} bytes below threshold {required}"
            ),
            DisableReason::Manual(m) => write!(f, "disabled: {m}"),
        }
    }
}

/// Validity check for whatever credential the active backends require.
pub trait CredentialCheck: Send + Sync {
    fn is_valid(&self) -> bool;
    fn describe(&self) -> String;
}

/// Default check for setups without credentials.
pub struct NoCredential;

impl CredentialCheck for NoCredential {
    fn is_valid(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

pub struct Coordinator {
    enabled: AtomicBool,
    reason: RwLock<Option<DisableReason>>,
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    credential: Arc<dyn CredentialCheck>,
    repo_root: PathBuf,
    min_free_bytes: u64,
}

impl Coordinator {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        credential: Arc<dyn CredentialCheck>,
        repo_root: impl Into<PathBuf>,
        min_free_bytes: u64,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            reason: RwLock::new(None),
            registry,
            pool,
            credential,
            repo_root: repo_root.into(),
            min_free_bytes,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<DisableReason> {
        self.reason
            .read()
            .expect("coordinator reason lock poisoned")
            .clone()
    }

    /// Disable all services: monitoring skips its cycles, the repository
    /// rejects mutation, the pool rejects new submissions. Queued work is
    /// kept.
    pub fn disable(&self, reason: DisableReason) {
        tracing::warn!(%reason, "Disabling services");
        *self
            .reason
            .write()
            .expect("coordinator reason lock poisoned") = Some(reason);
        self.enabled.store(false, Ordering::SeqCst);
        self.registry.repository().set_read_only(true);
        self.pool.freeze();
    }

    /// Explicit re-enable. Re-runs the checks that can trip services off;
    /// only when they pass are the repository and pool released.
    pub fn enable(&self) -> Result<()> {
        if let Some(violation) = self.current_violation() {
            return Err(MillError::ReadOnly(format!(
                "cannot re-enable services: {violation}"
            )));
        }
        *self
            .reason
            .write()
            .expect("coordinator reason lock poisoned") = None;
        self.enabled.store(true, Ordering::SeqCst);
        self.registry.repository().set_read_only(false);
        self.pool.unfreeze();
        tracing::info!("Services enabled");
        Ok(())
    }

    /// Periodic guard, called from the monitoring tick. Escalates to
    /// `disable` when a threshold is crossed; never re-enables by itself.
    pub fn check_resources(&self) {
        if !self.is_enabled() {
            return;
        }
        if let Some(violation) = self.current_violation() {
            self.disable(violation);
        }
    }

    fn current_violation(&self) -> Option<DisableReason> {
        if !self.credential.is_valid() {
            return Some(DisableReason::CredentialInvalid(self.credential.describe()));
        }
        if let Some(available) = free_bytes(&self.repo_root) {
            if available < self.min_free_bytes {
                return Some(DisableReason::DiskSpaceLow {
                    available,
                    required: self.min_free_bytes,
                });
            }
        }
        None
    }
}

/// Free space under `path`, if the filesystem answers.
fn free_bytes(path: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => Some(stat.blocks_available() as u64 * stat.fragment_size() as u64),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "statvfs failed, skipping disk check");
            None
        }
    }
}
