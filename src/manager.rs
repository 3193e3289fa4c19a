// src/manager.rs

use chrono::{DateTime, Local, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::downloader::{EngineError, ExtractionEngine, MediaInfo, TransferRequest};
use crate::models::{JobRecord, JobStatus};
use crate::output::{locate_output, output_template, safe_filename};
use crate::queue::{PoolError, PoolTask, TaskFailure, WorkerPool};
use crate::registry::{enforce_retention, JobRegistry, JobSlot};
use crate::settings::{Settings, SettingsError, SettingsStore};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("download {0} not found")]
    JobNotFound(String),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("extraction engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Why a running job ended in `error`. Only its message is kept.
#[derive(Debug, Error)]
enum TransferFailure {
    #[error("could not prepare {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Accepts download requests, runs them on the worker pool, and serves
/// snapshots of their progress.
pub struct JobManager {
    engine: Arc<dyn ExtractionEngine>,
    settings_store: SettingsStore,
    settings: RwLock<Settings>,
    registry: Arc<RwLock<JobRegistry>>,
    pool: WorkerPool,
    next_seq: AtomicU64,
}

impl JobManager {
    /// Loads settings and starts a pool sized by `max_concurrent_downloads`.
    /// Must be called inside a tokio runtime.
    pub async fn new(
        settings_store: SettingsStore,
        engine: Arc<dyn ExtractionEngine>,
        retain_finished: Option<usize>,
    ) -> Self {
        let settings = settings_store.load().await;
        if let Err(e) = tokio::fs::create_dir_all(&settings.download_path).await {
            tracing::warn!(
                path = %settings.download_path.display(),
                "could not create download directory: {e}"
            );
        }

        let registry = Arc::new(RwLock::new(JobRegistry::new(retain_finished)));
        let (pool, failures) = WorkerPool::new(settings.max_concurrent_downloads);
        tokio::spawn(watch_failures(registry.clone(), failures));

        tracing::info!(
            workers = pool.size(),
            download_dir = %settings.download_path.display(),
            "job manager ready"
        );
        Self {
            engine,
            settings_store,
            settings: RwLock::new(settings),
            registry,
            pool,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Creates a queued job and hands it to the pool. Returns without
    /// waiting for the job to start.
    pub async fn start_download(
        &self,
        url: &str,
        format_id: &str,
        filename: &str,
    ) -> Result<String, ManagerError> {
        for (field, value) in [("url", url), ("format_id", format_id), ("filename", filename)] {
            if value.trim().is_empty() {
                return Err(ManagerError::InvalidRequest(format!("{field} is required")));
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let id = job_id(url, format_id, seq, Utc::now());
        let record = JobRecord::new(id.clone(), url.to_string(), format_id.to_string(), filename.to_string());
        let slot = self.registry.write().await.insert(record);
        let output_dir = self.settings.read().await.download_path.clone();

        let job = DownloadJob {
            slot,
            engine: self.engine.clone(),
            output_dir,
            registry: self.registry.clone(),
        };
        if let Err(e) = self.pool.submit(PoolTask::new(id.clone(), job.run())) {
            self.registry.write().await.remove(&id);
            return Err(e.into());
        }

        tracing::info!(job = %id, %url, format = %format_id, "download queued");
        Ok(id)
    }

    /// A snapshot of one job.
    pub async fn get_job(&self, id: &str) -> Result<JobRecord, ManagerError> {
        let slot = self.registry.read().await.get(id);
        match slot {
            Some(slot) => Ok(slot.snapshot().await),
            None => Err(ManagerError::JobNotFound(id.to_string())),
        }
    }

    /// Snapshots of every job in the order they were started.
    pub async fn list_jobs(&self) -> Vec<JobRecord> {
        let slots = self.registry.read().await.slots();
        let mut jobs = Vec::with_capacity(slots.len());
        for slot in slots {
            jobs.push(slot.snapshot().await);
        }
        jobs
    }

    /// Asks the engine what encodings `url` offers.
    pub async fn analyze(&self, url: &str) -> Result<MediaInfo, ManagerError> {
        if url.trim().is_empty() {
            return Err(ManagerError::InvalidRequest("URL is required".to_string()));
        }
        Ok(self.engine.analyze(url).await?)
    }

    /// Output files of completed jobs, including ones written to a download
    /// directory that has since been replaced.
    pub async fn completed_outputs(&self) -> Vec<PathBuf> {
        self.list_jobs()
            .await
            .into_iter()
            .filter(|job| job.status() == JobStatus::Completed)
            .filter_map(|job| job.filepath().map(PathBuf::from))
            .collect()
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    pub async fn download_dir(&self) -> PathBuf {
        self.settings.read().await.download_path.clone()
    }

    /// Persists `settings` and switches the output directory for jobs
    /// submitted from now on. Queued and running jobs keep theirs.
    /// A new concurrency limit applies after restart.
    pub async fn save_settings(&self, mut settings: Settings) -> Result<(), ManagerError> {
        settings.max_concurrent_downloads = settings.max_concurrent_downloads.max(1);
        tokio::fs::create_dir_all(&settings.download_path)
            .await
            .map_err(SettingsError::from)?;
        self.settings_store.save(&settings).await?;

        if settings.max_concurrent_downloads != self.pool.size() {
            tracing::info!(
                requested = settings.max_concurrent_downloads,
                current = self.pool.size(),
                "new concurrency limit takes effect on restart"
            );
        }
        tracing::info!(download_dir = %settings.download_path.display(), "settings applied");
        *self.settings.write().await = settings;
        Ok(())
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Stops the pool from starting queued jobs.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// `<8 hex chars of digest><hex sequence>`; the fixed-width prefix makes the
/// sequence number alone decide uniqueness.
fn job_id(url: &str, format_id: &str, seq: u64, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(format_id.as_bytes());
    hasher.update(seq.to_le_bytes());
    hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{:x}", &digest[..8], seq)
}

/// Marks jobs whose task panicked as failed.
async fn watch_failures(
    registry: Arc<RwLock<JobRegistry>>,
    mut failures: mpsc::UnboundedReceiver<TaskFailure>,
) {
    while let Some(failure) = failures.recv().await {
        let slot = registry.read().await.get(&failure.key);
        let Some(slot) = slot else { continue };
        let message = format!("download worker crashed: {}", failure.message);
        if slot.fail(message, Utc::now()).await.is_ok() {
            tracing::error!(job = %failure.key, "download crashed: {}", failure.message);
        }
        enforce_retention(&registry).await;
    }
}

/// The work submitted to the pool for one job.
struct DownloadJob {
    slot: Arc<JobSlot>,
    engine: Arc<dyn ExtractionEngine>,
    output_dir: PathBuf,
    registry: Arc<RwLock<JobRegistry>>,
}

impl DownloadJob {
    async fn run(self) {
        let id = self.slot.id().to_string();
        if let Err(e) = self.slot.begin().await {
            tracing::warn!(job = %id, "not starting download: {e}");
            return;
        }
        tracing::info!(job = %id, "download started");

        let outcome = self.execute().await;
        let now = Utc::now();
        let transition = match outcome {
            Ok(filepath) => {
                tracing::info!(job = %id, filepath = ?filepath, "download completed");
                self.slot.complete(filepath, now).await
            }
            Err(e) => {
                tracing::warn!(job = %id, "download failed: {e}");
                self.slot.fail(e.to_string(), now).await
            }
        };
        if let Err(e) = transition {
            tracing::error!(job = %id, "could not record outcome: {e}");
        }
        enforce_retention(&self.registry).await;
    }

    async fn execute(&self) -> Result<Option<String>, TransferFailure> {
        let record = self.slot.snapshot().await;
        let safe_name = safe_filename(record.filename(), Local::now());

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| TransferFailure::Prepare {
                path: self.output_dir.clone(),
                source,
            })?;

        let request = TransferRequest {
            url: record.url().to_string(),
            format_id: record.format_id().to_string(),
            output_template: output_template(&self.output_dir, &safe_name),
        };

        // The engine reports over a channel; this task is its only reader,
        // so events land in the record in the order they were sent.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transfer = self.engine.download(request, tx);
        let apply = async {
            while let Some(event) = rx.recv().await {
                self.slot.record_progress(&event).await;
            }
        };
        let (result, ()) = tokio::join!(transfer, apply);
        result?;

        let found = match locate_output(&self.output_dir, &safe_name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(job = %self.slot.id(), "could not search for output file: {e}");
                None
            }
        };
        Ok(found.map(|path| path.to_string_lossy().into_owned()))
    }
}
