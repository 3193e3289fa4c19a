// src/queue.rs

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POOL_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool has shut down")]
    Closed,
}

/// A unit of work for the pool. `key` identifies the work in failure reports.
pub struct PoolTask {
    key: String,
    work: BoxFuture<'static, ()>,
}

impl PoolTask {
    pub fn new<F>(key: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            key: key.into(),
            work: Box::pin(work),
        }
    }
}

/// Reported when a task panics instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct Counters {
    finished: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed number of workers pulling from one unbounded FIFO queue.
///
/// There is no back-pressure: `submit` never waits and never rejects while
/// the pool is alive, so a burst of submissions simply queues up.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<PoolTask>,
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one) on the current runtime.
    /// The returned receiver yields a [`TaskFailure`] for every panicked task.
    pub fn new(size: usize) -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<PoolTask>();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(receiver));
        let shutdown = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let workers = (0..size)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    queue.clone(),
                    failure_tx.clone(),
                    counters.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        tracing::debug!(size, "worker pool started");
        let pool = Self {
            sender,
            workers,
            shutdown,
            counters,
        };
        (pool, failure_rx)
    }

    /// Enqueues a task and returns immediately.
    pub fn submit(&self, task: PoolTask) -> Result<(), PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }
        self.sender.send(task).map_err(|_| PoolError::Closed)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Tasks that ran to completion.
    pub fn finished(&self) -> u64 {
        self.counters.finished.load(Ordering::SeqCst)
    }

    /// Tasks that panicked.
    pub fn panicked(&self) -> u64 {
        self.counters.panicked.load(Ordering::SeqCst)
    }

    /// Stops workers from taking further tasks. Tasks already running are
    /// left to finish; queued ones are never started.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn worker_loop(
    index: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<PoolTask>>>,
    failures: mpsc::UnboundedSender<TaskFailure>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) {
    loop {
        // The queue lock is only held while waiting for the next task, so a
        // busy worker never blocks the others from dequeuing.
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            task = async { queue.lock().await.recv().await } => task,
        };
        let Some(task) = next else { break };

        let PoolTask { key, work } = task;
        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(()) => {
                counters.finished.fetch_add(1, Ordering::SeqCst);
            }
            Err(payload) => {
                counters.panicked.fetch_add(1, Ordering::SeqCst);
                let message = panic_message(payload.as_ref());
                tracing::error!(worker = index, task = %key, "task panicked: {message}");
                let _ = failures.send(TaskFailure { key, message });
            }
        }
    }
    tracing::debug!(worker = index, "worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
