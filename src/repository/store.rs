use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RepositoryConfig;
use crate::error::{MillError, Result};
use crate::model::{Document, Job, JobId, JobStatus, LoadError, LoadResult, PluginRegistry};
use crate::repository::serializer;

/// Lightweight listing record, cached so listing thousands of jobs never
/// deserializes full records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<IndexEntry>,
}

/// Exclusive per-record lock, backed by a companion lock file. Dropped
/// guards remove their file; a crashed process leaves a stale lock behind
/// that names the owning session for diagnostics.
#[derive(Debug)]
pub struct RecordLock {
    path: PathBuf,
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to release record lock");
            }
        }
    }
}

/// Durable, crash-safe storage of job records: one JSON document per job,
/// written with a temp-then-rename pattern so readers never observe a
/// partial record.
pub struct FileRepository {
    jobs_dir: PathBuf,
    index_path: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
    session: Uuid,
    read_only: AtomicBool,
    plugins: Arc<PluginRegistry>,
    index: Mutex<Vec<IndexEntry>>,
}

impl FileRepository {
    /// Open (or initialize) a repository under `config.root`. A missing or
    /// unreadable index cache is rebuilt from the record files.
    pub async fn open(config: &RepositoryConfig, plugins: Arc<PluginRegistry>) -> Result<Self> {
        let jobs_dir = config.root.join("jobs");
        tokio::fs::create_dir_all(&jobs_dir).await?;
        let index_path = config.root.join("index.json");

        let repo = Self {
            jobs_dir,
            index_path,
            lock_timeout: config.lock_timeout,
            lock_poll: config.lock_poll,
            session: Uuid::new_v4(),
            read_only: AtomicBool::new(false),
            plugins,
            index: Mutex::new(Vec::new()),
        };

        let entries = match repo.load_index().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Index cache unreadable, rebuilding from records");
                repo.rebuild_index().await?
            }
        };
        *repo.index.lock().await = entries;
        Ok(repo)
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// While read-only, every mutating call fails fast. Flipped by the
    /// coordinator when a credential lapses or disk space runs out.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            Err(MillError::ReadOnly(
                "services are disabled, repository mutation rejected".into(),
            ))
        } else {
            Ok(())
        }
    }

    fn record_path(&self, id: JobId) -> PathBuf {
        self.jobs_dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: JobId) -> PathBuf {
        self.jobs_dir.join(format!("{id}.lock"))
    }

    /// Acquire the exclusive lock for a record, waiting at most the
    /// configured lock timeout. Contention surfaces as a retryable
    /// `LockTimeout`, never an unbounded hang.
    pub async fn lock(&self, id: JobId) -> Result<RecordLock> {
        let path = self.lock_path(id);
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = writeln!(file, "{}", self.session);
                    return Ok(RecordLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(MillError::LockTimeout {
                            id,
                            waited_ms: self.lock_timeout.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(self.lock_poll).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Durably write a job record. The document goes to a temp file which
    /// is fsynced and atomically renamed over the previous version, so a
    /// crash mid-write leaves either the old or the new record, never a
    /// truncated one.
    pub async fn write(&self, job: &Job) -> Result<()> {
        self.check_writable()?;
        let doc = serializer::to_document(job)?;
        let text = serde_json::to_vec_pretty(&doc)?;

        let path = self.record_path(job.id);
        let tmp = self.jobs_dir.join(format!("{}.json.tmp", job.id));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&text).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        self.update_index_entry(IndexEntry {
            id: job.id,
            name: job.name.clone(),
            status: job.status,
            modified: Utc::now(),
        })
        .await?;
        tracing::debug!(job_id = %job.id, status = %job.status, "Record written");
        Ok(())
    }

    /// Load a record. A missing file is an error; a present but corrupt or
    /// schema-incompatible record yields a placeholder job plus recorded
    /// errors so one bad record never aborts a registry load.
    pub async fn read(&self, id: JobId) -> Result<LoadResult<Job>> {
        let path = self.record_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MillError::JobNotFound(id))
            }
            Err(e) => return Err(e.into()),
        };
        let doc: Document = match serde_json::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                return Ok(LoadResult::with_errors(
                    serializer::stub_job(id),
                    vec![LoadError::new("document", format!("malformed record: {e}"))],
                ));
            }
        };
        Ok(serializer::from_document(id, doc, &self.plugins))
    }

    pub async fn delete(&self, id: JobId) -> Result<()> {
        self.check_writable()?;
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MillError::JobNotFound(id))
            }
            Err(e) => return Err(e.into()),
        }
        let mut index = self.index.lock().await;
        index.retain(|entry| entry.id != id);
        let snapshot = index.clone();
        drop(index);
        self.persist_index(&snapshot).await?;
        tracing::debug!(job_id = %id, "Record deleted");
        Ok(())
    }

    pub async fn exists(&self, id: JobId) -> bool {
        self.record_path(id).exists()
    }

    /// All cached index entries, sorted by id.
    pub async fn list_index(&self) -> Vec<IndexEntry> {
        let mut entries = self.index.lock().await.clone();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Highest id currently present, for restoring the id counter on load.
    pub async fn max_id(&self) -> Option<JobId> {
        self.index.lock().await.iter().map(|e| e.id).max()
    }

    async fn update_index_entry(&self, entry: IndexEntry) -> Result<()> {
        let mut index = self.index.lock().await;
        match index.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => index.push(entry),
        }
        let snapshot = index.clone();
        drop(index);
        self.persist_index(&snapshot).await
    }

    async fn persist_index(&self, entries: &[IndexEntry]) -> Result<()> {
        let file = IndexFile {
            entries: entries.to_vec(),
        };
        let text = serde_json::to_vec(&file)?;
        let tmp = self.index_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &text).await?;
        tokio::fs::rename(&tmp, &self.index_path).await?;
        Ok(())
    }

    async fn load_index(&self) -> Result<Vec<IndexEntry>> {
        if !self.index_path.exists() {
            return self.rebuild_index().await;
        }
        let text = tokio::fs::read_to_string(&self.index_path).await?;
        let file: IndexFile = serde_json::from_str(&text)?;
        Ok(file.entries)
    }

    /// Rebuild the index by scanning the record files. Records that fail to
    /// parse still get an entry so listings account for them.
    async fn rebuild_index(&self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.jobs_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(id) = record_id_from_path(&path) else {
                continue;
            };
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            let (name, status) = match self.read(id).await {
                Ok(loaded) => (loaded.value.name.clone(), loaded.value.status),
                Err(_) => ("unloadable".to_string(), JobStatus::New),
            };
            entries.push(IndexEntry {
                id,
                name,
                status,
                modified,
            });
        }
        self.persist_index(&entries).await?;
        Ok(entries)
    }
}

fn record_id_from_path(path: &Path) -> Option<JobId> {
    if path.extension()? != "json" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.parse::<u32>().ok().map(JobId::new)
}
