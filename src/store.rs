//! Job persistence.
//!
//! The engine only ever sees the [`JobStore`] trait. A parked or crashed job
//! is fully described by its stored record, so any engine instance sharing
//! the store can pick it up again.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::PipelineError;
use crate::pipeline::Job;

pub trait JobStore: Send + Sync {
    fn load_job(&self, id: &str) -> impl Future<Output = Result<Job, PipelineError>> + Send;

    fn save_job(&self, job: &Job) -> impl Future<Output = Result<(), PipelineError>> + Send;

    /// All stored jobs, oldest first.
    fn list_jobs(&self) -> impl Future<Output = Result<Vec<Job>, PipelineError>> + Send;
}

/// Process-local store, mostly for tests and embedding.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    async fn load_job(&self, id: &str) -> Result<Job, PipelineError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound(id.to_string()))
    }

    async fn save_job(&self, job: &Job) -> Result<(), PipelineError> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// One pretty-printed JSON file per job.
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, PipelineError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PipelineError::InvalidInput(format!("invalid job id: {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl JobStore for FileJobStore {
    async fn load_job(&self, id: &str) -> Result<Job, PipelineError> {
        let path = self.path_for(id)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::JobNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    async fn save_job(&self, job: &Job) -> Result<(), PipelineError> {
        let path = self.path_for(&job.id)?;
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(job)?;
        // Write-then-rename so readers never observe a half-written record.
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(job_id = %job.id, state = %job.state, path = %path.display(), "job saved");
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            jobs.push(serde_json::from_str::<Job>(&contents)?);
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
