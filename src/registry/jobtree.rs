use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::RwLock;

use crate::error::{MillError, Result};
use crate::model::JobId;

/// Purely organizational directory hierarchy over job ids.
///
/// Paths map to sets of weak job-id references. The tree never owns a
/// job's lifecycle and is never the source of truth for job existence;
/// `cleanlinks` drops references to jobs that no longer exist.
#[derive(Debug, Default)]
pub struct JobTree {
    dirs: RwLock<BTreeMap<String, BTreeSet<JobId>>>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

impl JobTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn mkdir(&self, path: &str) {
        self.dirs
            .write()
            .await
            .entry(normalize(path))
            .or_default();
    }

    /// Attach a job reference under `path`, creating the directory if
    /// needed.
    pub async fn add(&self, path: &str, id: JobId) {
        self.dirs
            .write()
            .await
            .entry(normalize(path))
            .or_default()
            .insert(id);
    }

    /// Detach a job reference. Missing paths are an error; a missing id in
    /// an existing directory is not (the link may already be cleaned).
    pub async fn rm(&self, path: &str, id: JobId) -> Result<()> {
        let mut dirs = self.dirs.write().await;
        let set = dirs
            .get_mut(&normalize(path))
            .ok_or_else(|| MillError::Internal(format!("no such jobtree path '{path}'")))?;
        set.remove(&id);
        Ok(())
    }

    pub async fn listdirs(&self) -> Vec<String> {
        self.dirs.read().await.keys().cloned().collect()
    }

    pub async fn listjobs(&self, path: &str) -> Result<Vec<JobId>> {
        let dirs = self.dirs.read().await;
        let set = dirs
            .get(&normalize(path))
            .ok_or_else(|| MillError::Internal(format!("no such jobtree path '{path}'")))?;
        Ok(set.iter().copied().collect())
    }

    /// Self-heal: drop references to jobs that no longer exist in the
    /// registry. Returns the number of dangling links removed.
    pub async fn cleanlinks(&self, existing: &[JobId]) -> usize {
        let existing: BTreeSet<JobId> = existing.iter().copied().collect();
        let mut dirs = self.dirs.write().await;
        let mut removed = 0;
        for set in dirs.values_mut() {
            let before = set.len();
            set.retain(|id| existing.contains(id));
            removed += before - set.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "Cleaned dangling jobtree links");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_list_and_remove() {
        let tree = JobTree::default();
        tree.add("analysis/run1", JobId::new(1)).await;
        tree.add("analysis/run1", JobId::new(2)).await;
        tree.mkdir("empty").await;

        let jobs = tree.listjobs("analysis/run1").await.unwrap();
        assert_eq!(jobs, vec![JobId::new(1), JobId::new(2)]);
        assert!(tree.listjobs("/empty").await.unwrap().is_empty());
        assert!(tree.listjobs("missing").await.is_err());

        tree.rm("analysis/run1", JobId::new(1)).await.unwrap();
        assert_eq!(
            tree.listjobs("analysis/run1").await.unwrap(),
            vec![JobId::new(2)]
        );
    }

    #[tokio::test]
    async fn paths_are_normalized() {
        let tree = JobTree::default();
        tree.add("a/b/", JobId::new(3)).await;
        assert_eq!(tree.listjobs("/a/b").await.unwrap(), vec![JobId::new(3)]);
    }

    #[tokio::test]
    async fn cleanlinks_drops_dangling_references() {
        let tree = JobTree::default();
        tree.add("x", JobId::new(1)).await;
        tree.add("x", JobId::new(2)).await;
        tree.add("y", JobId::new(2)).await;

        let removed = tree.cleanlinks(&[JobId::new(2)]).await;
        assert_eq!(removed, 1);
        assert_eq!(tree.listjobs("x").await.unwrap(), vec![JobId::new(2)]);
        assert_eq!(tree.listjobs("y").await.unwrap(), vec![JobId::new(2)]);
    }
}
