// src/registry.rs

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::{JobRecord, JobStatus, ProgressEvent, TransitionError};
use crate::progress;

/// One job's record behind its own lock.
///
/// Only the task running the job writes through a slot; everyone else takes
/// snapshots. Writers never hold the lock across an await on I/O.
#[derive(Debug)]
pub struct JobSlot {
    id: String,
    record: RwLock<JobRecord>,
}

impl JobSlot {
    fn new(record: JobRecord) -> Self {
        Self {
            id: record.id().to_string(),
            record: RwLock::new(record),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A copy of the record as of now.
    pub async fn snapshot(&self) -> JobRecord {
        self.record.read().await.clone()
    }

    pub async fn status(&self) -> JobStatus {
        self.record.read().await.status()
    }

    pub(crate) async fn begin(&self) -> Result<(), TransitionError> {
        self.record.write().await.begin()
    }

    /// Translates `event` against the current record and writes the result.
    pub(crate) async fn record_progress(&self, event: &ProgressEvent) {
        let mut record = self.record.write().await;
        if let Some(update) = progress::translate(event, &record) {
            if let Err(e) = record.apply_progress(&update) {
                tracing::debug!(job = %self.id, "dropping progress event: {e}");
            }
        }
    }

    pub(crate) async fn complete(
        &self,
        filepath: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.record.write().await.complete(filepath, at)
    }

    pub(crate) async fn fail(&self, message: String, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.record.write().await.fail(message, at)
    }
}

/// Insertion-ordered map of job id to slot.
///
/// With `retain_finished` unset every job is kept for the life of the
/// process. When set, the oldest finished jobs beyond that count are evicted
/// by [`enforce_retention`].
#[derive(Debug, Default)]
pub struct JobRegistry {
    order: Vec<String>,
    slots: HashMap<String, Arc<JobSlot>>,
    retain_finished: Option<usize>,
}

impl JobRegistry {
    pub fn new(retain_finished: Option<usize>) -> Self {
        Self {
            retain_finished,
            ..Self::default()
        }
    }

    /// Adds a record. Ids are unique by construction, so an existing entry
    /// with the same id is a caller bug and is replaced.
    pub fn insert(&mut self, record: JobRecord) -> Arc<JobSlot> {
        let slot = Arc::new(JobSlot::new(record));
        let id = slot.id().to_string();
        if self.slots.insert(id.clone(), slot.clone()).is_none() {
            self.order.push(id);
        }
        slot
    }

    pub fn get(&self, id: &str) -> Option<Arc<JobSlot>> {
        self.slots.get(id).cloned()
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<JobSlot>> {
        let slot = self.slots.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(slot)
    }

    /// All slots in insertion order.
    pub fn slots(&self) -> Vec<Arc<JobSlot>> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn retain_finished(&self) -> Option<usize> {
        self.retain_finished
    }
}

/// Evicts the oldest finished jobs beyond the registry's retention limit.
/// Returns the evicted ids.
///
/// Statuses are read under the registry's read lock; the write lock is only
/// taken for the removals.
pub async fn enforce_retention(registry: &RwLock<JobRegistry>) -> Vec<String> {
    let (keep, slots) = {
        let registry = registry.read().await;
        let Some(keep) = registry.retain_finished() else {
            return Vec::new();
        };
        (keep, registry.slots())
    };

    let mut finished = Vec::new();
    for slot in slots {
        if slot.status().await.is_terminal() {
            finished.push(slot.id().to_string());
        }
    }
    let excess = finished.len().saturating_sub(keep);
    if excess == 0 {
        return Vec::new();
    }

    let mut registry = registry.write().await;
    let evicted: Vec<String> = finished
        .into_iter()
        .take(excess)
        .filter(|id| registry.remove(id).is_some())
        .collect();
    if !evicted.is_empty() {
        tracing::debug!(count = evicted.len(), "evicted finished jobs");
    }
    evicted
}
