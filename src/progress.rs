// src/progress.rs

use crate::models::{EventStatus, JobRecord, ProgressEvent};

/// Ceiling used while the total size is unknown; only the engine returning
/// successfully may take a job to 100.
pub const UNKNOWN_TOTAL_CEILING: f64 = 90.0;
/// Step applied per event when the total size is unknown.
pub const UNKNOWN_TOTAL_STEP: f64 = 10.0;

/// Normalized fields to write into a [`JobRecord`] after one event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
}

/// Maps a raw engine event onto the record's current values.
///
/// Returns `None` for events that are not transfer progress. Fields the
/// event does not carry keep their previous value.
pub fn translate(event: &ProgressEvent, current: &JobRecord) -> Option<ProgressUpdate> {
    if event.status != EventStatus::Downloading {
        return None;
    }

    let downloaded = event.downloaded_bytes.unwrap_or(current.downloaded_bytes());
    let total = event
        .total_bytes
        .filter(|&t| t > 0)
        .or(event.total_bytes_estimate.filter(|&t| t > 0));

    let progress = match total {
        Some(total) => (100.0 * downloaded as f64 / total as f64).clamp(0.0, 100.0),
        None => (current.progress() + UNKNOWN_TOTAL_STEP).min(UNKNOWN_TOTAL_CEILING),
    };

    Some(ProgressUpdate {
        progress,
        downloaded_bytes: downloaded,
        total_bytes: total.or(current.total_bytes()),
        speed: event.speed.or(current.speed()),
        eta: event.eta.or(current.eta()),
    })
}
