//! Worker loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::time::{Instant, timeout};
use tracing::{debug, error};

use super::{QueueItem, QueueState, Shared};
use crate::telemetry;
use crate::{MimirError, Result};

/// Pull items until the queue stops.
///
/// The receive is bounded by `poll_interval` so an idle worker notices the
/// running flag going down even when no work arrives.
pub(super) async fn run<T: Send + 'static>(shared: Arc<Shared<T>>, worker: usize) {
    debug!(worker, "inference worker started");

    while shared.is_running() {
        let item = {
            let mut rx = shared.rx.lock().await;
            match timeout(shared.config.poll_interval, rx.recv()).await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => continue,
            }
        };
        metrics::gauge!(telemetry::QUEUE_DEPTH).set(shared.queue_size() as f64);

        execute(&shared, worker, item).await;
    }

    debug!(worker, "inference worker exiting");
}

async fn execute<T: Send + 'static>(shared: &Shared<T>, worker: usize, item: QueueItem<T>) {
    let QueueItem {
        id,
        work,
        result_slot,
        enqueued_at,
    } = item;

    metrics::histogram!(telemetry::QUEUE_WAIT_SECONDS).record(enqueued_at.elapsed().as_secs_f64());
    debug!(worker, task_id = %id, "processing task");

    let slot = ActiveSlot::acquire(shared);
    let started = Instant::now();
    let run = async move { work().await };
    let result: Result<T> = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(MimirError::TaskPanicked(panic_message(panic.as_ref()))),
    };
    metrics::histogram!(telemetry::QUEUE_RUN_SECONDS).record(started.elapsed().as_secs_f64());
    slot.finish(result.is_ok());

    match &result {
        Ok(_) => {
            metrics::counter!(telemetry::QUEUE_COMPLETED_TOTAL, "status" => "ok").increment(1);
        }
        Err(e) => {
            metrics::counter!(telemetry::QUEUE_COMPLETED_TOTAL, "status" => "error").increment(1);
            error!(worker, task_id = %id, error = %e, "task failed");
        }
    }

    if result_slot.send(result).is_err() {
        debug!(worker, task_id = %id, "submitter went away before the result was ready");
    }
}

/// Holds one `active_tasks` slot for the duration of a task.
///
/// Released on drop as well, so a worker aborted mid-task does not leave
/// the counter inflated.
struct ActiveSlot<'a> {
    state: &'a std::sync::Mutex<QueueState>,
    finished: bool,
}

impl<'a> ActiveSlot<'a> {
    fn acquire<T>(shared: &'a Shared<T>) -> Self {
        shared.state().active_tasks += 1;
        Self {
            state: &shared.state,
            finished: false,
        }
    }

    fn finish(mut self, ok: bool) {
        let mut state = self.lock();
        state.active_tasks -= 1;
        if ok {
            state.total_processed += 1;
        } else {
            state.total_errors += 1;
        }
        drop(state);
        self.finished = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'a, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.lock().active_tasks -= 1;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
