//! Consumer pool: long-running workers draining the work queue.
//!
//! Each worker blocks on [`WorkQueue::take`], skips items that are no longer
//! valid, runs the rest through [`execute`], and exits once the queue is
//! closed and drained. A worker whose loop fails unexpectedly records the
//! failure and exits; the remaining workers keep going. Dead workers are
//! not restarted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::item::{WorkItem, invoke, panic_message};
use crate::model::State;
use crate::queue::WorkQueue;
use crate::sync::lock;
use crate::telemetry::metrics::SchedulerMetrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// How a consumer worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ExitStatus {
    /// The queue was closed and drained.
    Clean,
    /// The dispatch loop itself failed.
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub worker: usize,
    pub status: ExitStatus,
    pub exited_at: DateTime<Utc>,
}

/// A fixed set of consumer threads.
pub struct ConsumerPool {
    size: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    exits: Arc<Mutex<Vec<WorkerExit>>>,
    live: Arc<AtomicUsize>,
}

impl ConsumerPool {
    /// Spawn `size` workers on `queue`.
    ///
    /// Workers install `logger` as their default dispatcher when given. If a
    /// thread cannot be spawned, the queue is closed so the workers already
    /// started drain and exit.
    pub(crate) fn spawn<T: Send + Sync + 'static>(
        size: usize,
        queue: Arc<WorkQueue<WorkItem<T>>>,
        logger: Option<tracing::Dispatch>,
        metrics: SchedulerMetrics,
    ) -> Result<Self> {
        let pool = Self {
            size,
            handles: Mutex::new(Vec::with_capacity(size)),
            exits: Arc::new(Mutex::new(Vec::with_capacity(size))),
            live: Arc::new(AtomicUsize::new(0)),
        };

        for worker in 0..size {
            let queue_for_worker = Arc::clone(&queue);
            let logger = logger.clone();
            let metrics = metrics.clone();
            let exits = Arc::clone(&pool.exits);
            let live = Arc::clone(&pool.live);

            pool.live.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("workq-consumer-{worker}"))
                .spawn(move || {
                    let _dispatch = logger.as_ref().map(tracing::dispatcher::set_default);
                    let status = run_worker(worker, &queue_for_worker, &metrics);
                    live.fetch_sub(1, Ordering::AcqRel);
                    lock(&exits).push(WorkerExit {
                        worker,
                        status,
                        exited_at: Utc::now(),
                    });
                });

            match spawned {
                Ok(handle) => lock(&pool.handles).push(handle),
                Err(e) => {
                    pool.live.fetch_sub(1, Ordering::AcqRel);
                    queue.close();
                    return Err(e.into());
                }
            }
        }

        Ok(pool)
    }

    /// Configured number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers whose loop is still running.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Exit records collected so far.
    pub fn exits(&self) -> Vec<WorkerExit> {
        lock(&self.exits).clone()
    }

    /// Wait for every worker to exit. Only returns once the queue is closed.
    ///
    /// Called from a worker thread, that worker is skipped rather than
    /// joined with itself.
    pub fn join(&self) -> Vec<WorkerExit> {
        let handles = std::mem::take(&mut *lock(&self.handles));
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("consumer thread panicked outside its dispatch loop");
            }
        }
        self.exits()
    }
}

fn run_worker<T: Send + Sync + 'static>(
    worker: usize,
    queue: &WorkQueue<WorkItem<T>>,
    metrics: &SchedulerMetrics,
) -> ExitStatus {
    info!(worker, "consumer started");
    let label = format!("consumer-{worker}");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        while let Some(item) = queue.take() {
            execute(&item, queue, &label, metrics);
        }
    }));

    match outcome {
        Ok(()) => {
            info!(worker, "consumer done");
            ExitStatus::Clean
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(worker, error = %message, "consumer failed, worker exiting");
            ExitStatus::Errored(message)
        }
    }
}

/// Run one item that already holds an in-flight slot.
///
/// Returns whether the action ran. The in-flight slot is released before
/// the outcome is published, so an observer that sees the item terminal
/// also sees the load without it. The item is always retired afterwards.
pub(crate) fn execute<T: Send + Sync + 'static>(
    item: &WorkItem<T>,
    queue: &WorkQueue<WorkItem<T>>,
    worker: &str,
    metrics: &SchedulerMetrics,
) -> bool {
    let span = start_work_span(worker, &item.id());
    let from = item.state();

    let Some(action) = item.begin() else {
        queue.finish();
        if item.cancel_pending() {
            debug!(id = %item.id(), worker, "work item no longer valid, canceled");
        } else {
            let state = item.state();
            debug!(id = %item.id(), worker, %state, "work item already claimed, skipped");
        }
        // A running item is retired by the runner that claimed it.
        if item.state() != State::Running {
            item.retire();
        }
        return false;
    };
    record_state_transition(&span, from, State::Running);

    let started = Instant::now();
    let result = span.in_scope(|| invoke(action));
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    queue.finish();

    let to = match &result {
        Ok(_) => State::Completed,
        Err(message) => {
            debug!(id = %item.id(), worker, error = %message, "work item action faulted");
            State::Faulted
        }
    };
    match item.conclude(result) {
        Ok(()) => {
            record_state_transition(&span, State::Running, to);
            metrics.record_finished(to, elapsed_ms);
        }
        Err(e) => {
            // Deadline or disposal won the race; the action's result is dropped.
            debug!(id = %item.id(), worker, reason = %e, "work item outcome discarded");
            metrics.record_finished(item.state(), elapsed_ms);
        }
    }

    item.retire();
    true
}
