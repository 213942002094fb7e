//! Scheduler facade. The public API for submitting and observing work.
//!
//! Owns the queue, the consumer pool and admission control. Once disposed
//! it refuses new work, lets consumers drain what is already queued, and
//! never interrupts an action that is running.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::admission::Capacity;
use super::consumer::{ConsumerPool, WorkerExit, execute};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::item::WorkItem;
use crate::model::{WorkId, WorkOptions, WorkSnapshot};
use crate::queue::WorkQueue;
use crate::sync::lock;
use crate::telemetry::metrics::SchedulerMetrics;

/// A bounded pool of consumer workers fed by a FIFO queue.
///
/// `T` is the value produced by the scheduled actions; `()` covers
/// fire-and-forget work.
pub struct Scheduler<T: Send + Sync + 'static = ()> {
    config: SchedulerConfig,
    capacity: Capacity,
    queue: Arc<WorkQueue<WorkItem<T>>>,
    consumers: ConsumerPool,
    /// Serializes capacity checks. Not held across the queue insert.
    admission: Mutex<()>,
    disposed: AtomicBool,
    logger: Option<tracing::Dispatch>,
    metrics: SchedulerMetrics,
}

/// Builder for a [`Scheduler`] with non-default settings or an injected logger.
pub struct SchedulerBuilder<T> {
    config: SchedulerConfig,
    logger: Option<tracing::Dispatch>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> SchedulerBuilder<T> {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn consumer_count(mut self, count: usize) -> Self {
        self.config.consumer_count = count;
        self
    }

    pub fn due_time_secs(mut self, secs: u64) -> Self {
        self.config.due_time_secs = secs;
        self
    }

    pub fn max_queue_items(mut self, max: i64) -> Self {
        self.config.max_queue_items = max;
        self
    }

    /// Route the scheduler's diagnostics to `logger` instead of the global subscriber.
    pub fn logger(mut self, logger: impl Into<tracing::Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    pub fn build(self) -> Result<Scheduler<T>> {
        Scheduler::start(self.config, self.logger)
    }
}

impl<T: Send + Sync + 'static> Scheduler<T> {
    /// Start a scheduler with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self> {
        Self::start(config, None)
    }

    pub fn builder() -> SchedulerBuilder<T> {
        SchedulerBuilder {
            config: SchedulerConfig::default(),
            logger: None,
            _marker: PhantomData,
        }
    }

    fn start(config: SchedulerConfig, logger: Option<tracing::Dispatch>) -> Result<Self> {
        config.validate()?;

        let metrics = SchedulerMetrics::new();
        let queue = Arc::new(WorkQueue::new());
        let consumers = in_scope(&logger, || {
            ConsumerPool::spawn(
                config.consumer_count,
                Arc::clone(&queue),
                logger.clone(),
                metrics.clone(),
            )
        })?;

        let scheduler = Self {
            capacity: config.capacity().into(),
            config,
            queue,
            consumers,
            admission: Mutex::new(()),
            disposed: AtomicBool::new(false),
            logger,
            metrics,
        };
        scheduler.logged(|| {
            info!(
                consumers = scheduler.config.consumer_count,
                due_time_secs = scheduler.config.due_time_secs,
                max_queue_items = scheduler.config.max_queue_items,
                "scheduler started"
            )
        });
        Ok(scheduler)
    }

    fn logged<R>(&self, f: impl FnOnce() -> R) -> R {
        in_scope(&self.logger, f)
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Wrap `action` as a work item with the configured due-time and queue it.
    pub fn enqueue<F>(&self, action: F) -> Result<WorkItem<T>>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue_with_options(action, WorkOptions::new())
    }

    /// Like [`enqueue`](Self::enqueue); `callback` gets the value before the item turns terminal.
    pub fn enqueue_with_callback<F, C>(&self, action: F, callback: C) -> Result<WorkItem<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(&T) + Send + 'static,
    {
        self.enqueue_with_options(action, WorkOptions::new().callback(callback))
    }

    pub fn enqueue_with_options<F>(&self, action: F, options: WorkOptions<T>) -> Result<WorkItem<T>>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue_fallible(move || Ok(action()), options)
    }

    /// Queue an action whose `Err` faults the item.
    pub fn enqueue_fallible<F>(&self, action: F, options: WorkOptions<T>) -> Result<WorkItem<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.ensure_active()?;
        let item = self.wrap(action, options)?;
        self.admit(vec![item.clone()])?;
        Ok(item)
    }

    /// Queue an item built by the caller.
    pub fn enqueue_item(&self, item: WorkItem<T>) -> Result<()> {
        self.admit(vec![item])
    }

    /// Queue every item or none of them. An empty batch is rejected.
    pub fn enqueue_batch(&self, items: impl IntoIterator<Item = WorkItem<T>>) -> Result<()> {
        let items: Vec<_> = items.into_iter().collect();
        if items.is_empty() {
            return Err(Error::InvalidArgument("work item batch is empty".to_string()));
        }
        self.admit(items)
    }

    fn admit(&self, items: Vec<WorkItem<T>>) -> Result<()> {
        self.logged(|| {
            self.ensure_active()?;

            let mut seen = HashSet::with_capacity(items.len());
            for item in &items {
                if !seen.insert(item.id()) {
                    return Err(Error::InvalidArgument(format!(
                        "work item {} appears twice in the batch",
                        item.id()
                    )));
                }
            }

            {
                let _admission = lock(&self.admission);
                if let Err(e) = self.capacity.check(self.queue.load(), items.len()) {
                    self.metrics.record_rejected(items.len());
                    debug!(count = items.len(), error = %e, "admission denied");
                    return Err(e);
                }
            }

            for (marked, item) in items.iter().enumerate() {
                if let Err(e) = item.mark_queued() {
                    items[..marked].iter().for_each(WorkItem::unmark_queued);
                    return Err(e);
                }
            }
            let ids: Vec<WorkId> = items.iter().map(WorkItem::id).collect();
            let count = items.len();
            if let Err(e) = self.queue.add_all(items.clone()) {
                items.iter().for_each(WorkItem::unmark_queued);
                return Err(match e {
                    Error::AlreadyClosed => Error::Disposed("scheduler"),
                    other => other,
                });
            }

            self.metrics.record_admitted(count);
            for id in ids {
                debug!(%id, "work item enqueued");
            }
            Ok(())
        })
    }

    fn wrap<F>(&self, action: F, options: WorkOptions<T>) -> Result<WorkItem<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let due_time = options.due_time.unwrap_or_else(|| self.config.due_time());
        let callback = options.callback;
        WorkItem::fallible(
            move || {
                let value = action()?;
                if let Some(callback) = callback {
                    callback(&value);
                }
                Ok(value)
            },
            due_time,
        )
    }

    fn ensure_active(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed("scheduler"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inline execution
    // -----------------------------------------------------------------------

    /// Run `item` on the calling thread, bypassing the queue.
    ///
    /// Returns `Ok(false)` when the item is not runnable (canceled, expired,
    /// already running or done); admission errors are returned as `Err`.
    /// An item waiting in this scheduler's queue already counts against
    /// capacity and runs without a second check; its queue entry is skipped
    /// on dispatch.
    pub fn try_execute_now(&self, item: &WorkItem<T>) -> Result<bool> {
        self.logged(|| {
            self.ensure_active()?;
            if self.find_queued(item.id()).is_none() {
                let _admission = lock(&self.admission);
                self.capacity.check(self.queue.load(), 1)?;
            }

            if !item.is_runnable() {
                debug!(id = %item.id(), "work item not runnable, skipping inline execution");
                return Ok(false);
            }

            self.queue.track();
            Ok(execute(item, &self.queue, "inline", &self.metrics))
        })
    }

    /// Wrap `action` and run it inline. The returned item is already terminal.
    pub fn try_execute_action_now<F>(&self, action: F, options: WorkOptions<T>) -> Result<WorkItem<T>>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.ensure_active()?;
        let item = self.wrap(move || Ok(action()), options)?;
        self.try_execute_now(&item)?;
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Maximum number of actions running at once on consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.size()
    }

    /// Consumers whose loop has not exited.
    pub fn live_consumers(&self) -> usize {
        self.consumers.live()
    }

    /// No item is pending or in flight.
    pub fn all_tasks_completed(&self) -> bool {
        self.queue.load() == 0
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.queue.in_flight()
    }

    /// Point-in-time view of the queued items, in dequeue order.
    pub fn enqueued_work_items(&self) -> Vec<WorkSnapshot> {
        // Clone out first: reading an item's state may run its continuations.
        self.queue
            .snapshot(WorkItem::clone)
            .iter()
            .map(WorkItem::snapshot)
            .collect()
    }

    /// The queued item with `id`, if no consumer has taken it yet.
    pub fn find_queued(&self, id: WorkId) -> Option<WorkItem<T>> {
        self.queue.find(|item| item.id() == id)
    }

    /// Block until nothing is pending or in flight. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    pub fn worker_exits(&self) -> Vec<WorkerExit> {
        self.consumers.exits()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop admitting work and let consumers exit once the queue is drained.
    ///
    /// Idempotent. Running actions are never interrupted; queued items past
    /// their deadline are flagged canceled here so they are skipped on dispatch.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.close();

        let queued = self.queue.snapshot(WorkItem::clone);
        let expired = queued.iter().filter(|item| !item.is_valid()).count();
        self.logged(|| {
            info!(
                pending = queued.len(),
                expired,
                in_flight = self.queue.in_flight(),
                "scheduler disposed, draining"
            )
        });
    }

    /// Dispose and wait for every consumer to exit.
    pub fn shutdown(&self) -> Vec<WorkerExit> {
        self.dispose();
        let exits = self.consumers.join();
        self.logged(|| info!(workers = exits.len(), "scheduler shut down"));
        exits
    }
}

impl<T: Send + Sync + 'static> Drop for Scheduler<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn in_scope<R>(logger: &Option<tracing::Dispatch>, f: impl FnOnce() -> R) -> R {
    match logger {
        Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
        None => f(),
    }
}
