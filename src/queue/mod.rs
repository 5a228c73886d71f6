//! Bounded inference queue with a fixed worker pool.
//!
//! Decouples request concurrency (many simultaneous callers) from inference
//! concurrency (a few slow model calls). Callers hand a unit of work to
//! [`InferenceQueue::submit()`] and await its result; `max_concurrent`
//! long-lived workers pull items in FIFO order and execute them.
//!
//! # Backpressure
//!
//! The queue holds at most `max_queue_size` pending items. A submission
//! beyond that fails immediately with [`MimirError::QueueFull`] instead of
//! waiting, which bounds both worst-case latency and memory. Producers must
//! treat the rejection as retryable ("try again shortly"), never as a fault.
//!
//! # Lifecycle
//!
//! `stopped -> running -> stopped`. [`start()`](InferenceQueue::start) spawns
//! the workers; [`stop()`](InferenceQueue::stop) cancels them and resolves
//! every caller still waiting (queued or interrupted mid-execution) with
//! [`MimirError::Cancelled`], so nobody hangs on a dead queue.
//!
//! # Ordering
//!
//! Admission is FIFO, completion is not: workers finish in whatever order
//! their work takes. Each item runs at most once and its result reaches
//! exactly the caller that submitted it.

mod config;
mod worker;

pub use config::QueueConfig;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::telemetry;
use crate::{MimirError, Result};

/// Deferred work: a boxed closure owning everything it needs.
type Work<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// A submitted task waiting for (or being processed by) a worker.
struct QueueItem<T> {
    id: String,
    work: Work<T>,
    result_slot: oneshot::Sender<Result<T>>,
    enqueued_at: Instant,
}

/// Lifecycle flag and counters, guarded together so snapshots are consistent.
#[derive(Debug, Default)]
struct QueueState {
    running: bool,
    active_tasks: usize,
    total_processed: u64,
    total_errors: u64,
}

/// State shared between the queue handle and its workers.
struct Shared<T> {
    config: QueueConfig,
    tx: mpsc::Sender<QueueItem<T>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<QueueItem<T>>>,
    state: Mutex<QueueState>,
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.state().running
    }

    fn queue_size(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Snapshot of the queue's state and lifetime counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub running: bool,
    pub workers: usize,
    pub queue_size: usize,
    pub max_queue_size: usize,
    pub active_tasks: usize,
    pub total_processed: u64,
    pub total_errors: u64,
}

/// Handle to an admitted task.
#[must_use = "a ticket does nothing unless waited on"]
pub struct Ticket<T> {
    id: String,
    result: oneshot::Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    /// Id the task was submitted under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the task's result.
    pub async fn wait(self) -> Result<T> {
        match self.result.await {
            Ok(outcome) => outcome,
            // Worker aborted mid-task; the slot was dropped unresolved.
            Err(_) => Err(MimirError::Cancelled),
        }
    }
}

/// Admission-controlled work queue executing tasks that produce a `T`.
pub struct InferenceQueue<T> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> InferenceQueue<T> {
    /// Create a stopped queue. Zero-sized pools and queues are treated as one.
    pub fn new(config: QueueConfig) -> Self {
        let config = QueueConfig {
            max_concurrent: config.max_concurrent.max(1),
            max_queue_size: config.max_queue_size.max(1),
            ..config
        };
        let (tx, rx) = mpsc::channel(config.max_queue_size);

        Self {
            shared: Arc::new(Shared {
                config,
                tx,
                rx: tokio::sync::Mutex::new(rx),
                state: Mutex::new(QueueState::default()),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool. Calling this on a running queue does nothing.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn start(&self) {
        {
            let mut state = self.shared.state();
            if state.running {
                return;
            }
            state.running = true;
        }

        let mut workers = self.workers();
        for id in 0..self.shared.config.max_concurrent {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker::run(shared, id)));
        }

        info!(
            workers = self.shared.config.max_concurrent,
            max_queue_size = self.shared.config.max_queue_size,
            "inference queue started"
        );
    }

    /// Stop the worker pool and cancel everything still outstanding.
    ///
    /// Workers are aborted; a task interrupted mid-execution and every task
    /// still queued resolve their callers with [`MimirError::Cancelled`].
    /// Calling this on a stopped queue does nothing.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.state();
            if !state.running {
                return;
            }
            state.running = false;
        }

        let handles = std::mem::take(&mut *self.workers());
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "inference worker exited abnormally");
                }
            }
        }

        let mut rx = self.shared.rx.lock().await;
        let mut drained = 0usize;
        while let Ok(item) = rx.try_recv() {
            let _ = item.result_slot.send(Err(MimirError::Cancelled));
            drained += 1;
        }
        metrics::gauge!(telemetry::QUEUE_DEPTH).set(0.0);

        info!(drained, "inference queue stopped");
    }

    /// Enqueue `work` under `task_id` and wait for its result.
    ///
    /// Fails immediately with [`MimirError::QueueFull`] when the queue is at
    /// capacity and with [`MimirError::NotRunning`] when the queue is
    /// stopped. Otherwise returns exactly what `work` produced, or
    /// [`MimirError::Cancelled`] if the queue was stopped first.
    pub async fn submit<F, Fut>(&self, task_id: impl Into<String>, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.try_submit(task_id, work)?.wait().await
    }

    /// Enqueue `work` without waiting for it to run.
    ///
    /// Admission is decided here, with the same rejections as
    /// [`submit()`](Self::submit). The returned [`Ticket`] resolves to the
    /// task's result; dropping it does not cancel the task.
    pub fn try_submit<F, Fut>(&self, task_id: impl Into<String>, work: F) -> Result<Ticket<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = task_id.into();
        let (result_slot, result) = oneshot::channel();
        let item = QueueItem {
            id: id.clone(),
            work: Box::new(move || work().boxed()),
            result_slot,
            enqueued_at: Instant::now(),
        };

        self.enqueue(item)?;

        let queue_size = self.shared.queue_size();
        metrics::gauge!(telemetry::QUEUE_DEPTH).set(queue_size as f64);
        debug!(
            task_id = %id,
            position = queue_size,
            max_queue_size = self.shared.config.max_queue_size,
            "task queued"
        );

        Ok(Ticket { id, result })
    }

    /// Snapshot of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state();
        QueueStats {
            running: state.running,
            workers: self.shared.config.max_concurrent,
            queue_size: self.shared.queue_size(),
            max_queue_size: self.shared.config.max_queue_size,
            active_tasks: state.active_tasks,
            total_processed: state.total_processed,
            total_errors: state.total_errors,
        }
    }

    /// Whether the queue is accepting work.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether a submission right now would be rejected for capacity.
    pub fn is_full(&self) -> bool {
        self.shared.tx.capacity() == 0
    }

    // The state lock is held across the send so `stop()` cannot drain the
    // channel between the running check and the item landing in it.
    fn enqueue(&self, item: QueueItem<T>) -> Result<()> {
        let state = self.shared.state();
        if !state.running {
            return Err(MimirError::NotRunning);
        }

        match self.shared.tx.try_send(item) {
            Ok(()) => {
                metrics::counter!(telemetry::QUEUE_SUBMITTED_TOTAL).increment(1);
                Ok(())
            }
            Err(TrySendError::Full(item)) => {
                drop(state);
                let max = self.shared.config.max_queue_size;
                metrics::counter!(telemetry::QUEUE_REJECTED_TOTAL).increment(1);
                warn!(task_id = %item.id, max_queue_size = max, "queue full, rejecting task");
                Err(MimirError::QueueFull { max })
            }
            Err(TrySendError::Closed(_)) => Err(MimirError::NotRunning),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for InferenceQueue<T> {
    fn drop(&mut self) {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running = false;
        let workers = self.workers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in workers.drain(..) {
            handle.abort();
        }
    }
}
