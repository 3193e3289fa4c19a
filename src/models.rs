// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::progress::ProgressUpdate;

/// The status of a download job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Completed,
    Error,
}

impl JobStatus {
    /// `Completed` and `Error` are final; nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// The observable state of a single download job.
///
/// Fields are private: the status machine
/// `Queued -> Downloading -> {Completed | Error}` (plus `Queued -> Error`)
/// is enforced by the mutating methods, and the terminal fields
/// (`completed_at`, `error`, `filepath`) can only be written by the
/// transition that owns them.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    id: String,
    url: String,
    format_id: String,
    filename: String,
    status: JobStatus,
    progress: f64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    filepath: Option<String>,
    downloaded_bytes: u64,
    total_bytes: Option<u64>,
    /// Bytes per second, as last reported by the engine.
    speed: Option<f64>,
    /// Seconds remaining, as last reported by the engine.
    eta: Option<u64>,
}

impl JobRecord {
    pub fn new(id: String, url: String, format_id: String, filename: String) -> Self {
        Self {
            id,
            url,
            format_id,
            filename,
            status: JobStatus::Queued,
            progress: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            filepath: None,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: None,
            eta: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format_id(&self) -> &str {
        &self.format_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Percentage in `0.0..=100.0`. Only meaningful while downloading;
    /// use [`JobRecord::status`] to decide whether the job is done.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn filepath(&self) -> Option<&str> {
        self.filepath.as_deref()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    pub fn eta(&self) -> Option<u64> {
        self.eta
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        let allowed = matches!(
            (self.status, to),
            (JobStatus::Queued, JobStatus::Downloading)
                | (JobStatus::Queued, JobStatus::Error)
                | (JobStatus::Downloading, JobStatus::Completed)
                | (JobStatus::Downloading, JobStatus::Error)
        );
        if !allowed {
            return Err(TransitionError { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Downloading)
    }

    /// Writes translated progress fields. Rejected unless downloading.
    pub(crate) fn apply_progress(&mut self, update: &ProgressUpdate) -> Result<(), TransitionError> {
        if self.status != JobStatus::Downloading {
            return Err(TransitionError {
                from: self.status,
                to: JobStatus::Downloading,
            });
        }
        self.progress = update.progress;
        self.downloaded_bytes = update.downloaded_bytes;
        self.total_bytes = update.total_bytes;
        self.speed = update.speed;
        self.eta = update.eta;
        Ok(())
    }

    pub(crate) fn complete(
        &mut self,
        filepath: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100.0;
        self.filepath = filepath;
        self.completed_at = Some(at);
        Ok(())
    }

    pub(crate) fn fail(&mut self, message: String, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Error)?;
        self.error = Some(message);
        self.completed_at = Some(at);
        Ok(())
    }
}

/// What the engine says it is doing when it emits a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Downloading,
    Finished,
    Other,
}

/// A raw progress notification from the extraction engine.
/// Every numeric field is optional: engines report what they know.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub status: EventStatus,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
}

impl ProgressEvent {
    pub fn downloading(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            status: EventStatus::Downloading,
            downloaded_bytes: Some(downloaded_bytes),
            total_bytes,
            total_bytes_estimate: None,
            speed: None,
            eta: None,
        }
    }
}
