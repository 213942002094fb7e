//! Host async integration.
//!
//! [`ExecutorAdapter`] lets ordinary Rust futures run on a scheduler's
//! consumer pool. Every poll of a [`HostTask`] is one work item: waking the
//! task asks for new work, and the consumer that picks the item up polls the
//! future once. Futures polled here get no tokio reactor context, so they
//! must be runtime-agnostic (channels, `futures` combinators and the like).

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};

use futures::task::{FutureObj, Spawn, SpawnError};
use tokio::sync::watch;
use tracing::debug;

use crate::engine::Scheduler;
use crate::error::{Error, Result};
use crate::item::{WorkItem, panic_message};
use crate::model::{Outcome, WorkId};
use crate::sync::lock;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Poll-state of a host task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Parked until its waker fires.
    Idle = 0,
    /// A work item for the next poll is queued or about to be.
    Scheduled = 1,
    /// Being polled.
    Running = 2,
    /// Woken while being polled; needs another poll.
    Notified = 3,
    Done = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Scheduled,
            2 => Self::Running,
            3 => Self::Notified,
            _ => Self::Done,
        }
    }
}

/// How a host task ended, as seen by its [`TaskHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Finished,
    /// A poll item was canceled before it ran.
    Canceled,
    Failed(String),
}

/// A host continuation: one boxed future plus its wake state.
pub struct HostTask {
    id: WorkId,
    phase: AtomicU8,
    future: Mutex<Option<BoxFuture>>,
    /// Work item carrying the next poll, while one is outstanding.
    queued: Mutex<Option<WorkId>>,
    scheduler: Weak<Scheduler<()>>,
    status: watch::Sender<TaskStatus>,
}

impl HostTask {
    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == Phase::Done
    }

    /// Id of the work item holding this task's next poll, if one is queued.
    pub fn queued_work(&self) -> Option<WorkId> {
        *lock(&self.queued)
    }

    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn swap_phase(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a wake-up. True when the caller must submit a poll item.
    fn request(&self) -> bool {
        loop {
            match self.phase() {
                Phase::Idle => {
                    if self.swap_phase(Phase::Idle, Phase::Scheduled) {
                        return true;
                    }
                }
                Phase::Running => {
                    if self.swap_phase(Phase::Running, Phase::Notified) {
                        return false;
                    }
                }
                Phase::Scheduled | Phase::Notified | Phase::Done => return false,
            }
        }
    }

    /// Poll the future once. Runs as a work item's action.
    fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.swap_phase(Phase::Scheduled, Phase::Running) {
            return Ok(());
        }
        lock(&self.queued).take();

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let polled = {
            let mut slot = lock(&self.future);
            let Some(future) = slot.as_mut() else {
                return Ok(());
            };
            panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
        };

        match polled {
            Ok(Poll::Ready(())) => {
                self.complete(TaskStatus::Finished);
                Ok(())
            }
            Ok(Poll::Pending) => {
                if self.swap_phase(Phase::Running, Phase::Idle) {
                    return Ok(());
                }
                // Woken mid-poll.
                self.phase.store(Phase::Scheduled as u8, Ordering::Release);
                self.resubmit();
                Ok(())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.complete(TaskStatus::Failed(message.clone()));
                Err(anyhow::anyhow!(message))
            }
        }
    }

    fn resubmit(self: &Arc<Self>) {
        match self.scheduler.upgrade() {
            Some(scheduler) => {
                if let Err(e) = ExecutorAdapter::new(scheduler).submit(self) {
                    debug!(task = %self.id, error = %e, "host task could not be rescheduled");
                }
            }
            None => self.complete(TaskStatus::Failed("scheduler dropped".to_string())),
        }
    }

    fn complete(&self, status: TaskStatus) {
        self.phase.store(Phase::Done as u8, Ordering::Release);
        lock(&self.future).take();
        lock(&self.queued).take();
        self.status.send_if_modified(|current| {
            if *current == TaskStatus::Pending {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

impl Wake for HostTask {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.request() {
            self.resubmit();
        }
    }
}

impl fmt::Debug for HostTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTask")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("queued", &self.queued_work())
            .finish()
    }
}

/// Await the end of a spawned host task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: Arc<HostTask>,
}

impl TaskHandle {
    pub fn id(&self) -> WorkId {
        self.task.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn task(&self) -> &Arc<HostTask> {
        &self.task
    }

    /// Wait for the future to finish. Only the awaiting task is suspended.
    pub async fn join(&self) -> Result<()> {
        let mut rx = self.task.status.subscribe();
        let status = rx
            .wait_for(|status| *status != TaskStatus::Pending)
            .await
            .map_err(|e| Error::Other(format!("host task status channel closed: {e}")))?
            .clone();
        match status {
            TaskStatus::Finished => Ok(()),
            TaskStatus::Canceled => Err(Error::OperationCanceled { id: self.task.id }),
            TaskStatus::Failed(message) => Err(Error::ExecutionFault {
                id: self.task.id,
                message,
            }),
            TaskStatus::Pending => Err(Error::Other("host task still pending".to_string())),
        }
    }
}

/// Runs host futures on a scheduler's consumer pool.
#[derive(Clone)]
pub struct ExecutorAdapter {
    scheduler: Arc<Scheduler<()>>,
}

impl ExecutorAdapter {
    pub fn new(scheduler: Arc<Scheduler<()>>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<()>> {
        &self.scheduler
    }

    /// Wrap `future` as a host task without scheduling it.
    pub fn task<F>(&self, future: F) -> Arc<HostTask>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (status, _) = watch::channel(TaskStatus::Pending);
        Arc::new(HostTask {
            id: WorkId::new(),
            phase: AtomicU8::new(Phase::Idle as u8),
            future: Mutex::new(Some(Box::pin(future))),
            queued: Mutex::new(None),
            scheduler: Arc::downgrade(&self.scheduler),
            status,
        })
    }

    /// Schedule `future` on the pool.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.task(future);
        self.on_new_async_work_requested(&task)?;
        Ok(TaskHandle { task })
    }

    /// Queue a poll of `task` as a work item.
    ///
    /// No-op when a poll is already queued or running, or the task is done.
    /// If admission is refused the task fails with the same error.
    pub fn on_new_async_work_requested(&self, task: &Arc<HostTask>) -> Result<()> {
        if !task.request() {
            return Ok(());
        }
        self.submit(task)
    }

    /// Poll `task` on the calling thread, now.
    ///
    /// With `was_previously_queued`, the queued poll item is looked up by id
    /// and run in place of the consumer; `Ok(false)` means a consumer already
    /// took it. Otherwise the task is claimed and polled through
    /// [`Scheduler::try_execute_now`].
    pub fn try_run_inline(&self, task: &Arc<HostTask>, was_previously_queued: bool) -> Result<bool> {
        if was_previously_queued {
            let Some(id) = task.queued_work() else {
                return Ok(false);
            };
            return match self.scheduler.find_queued(id) {
                Some(item) => self.scheduler.try_execute_now(&item),
                None => Ok(false),
            };
        }

        if !task.swap_phase(Phase::Idle, Phase::Scheduled) {
            return Ok(false);
        }
        let item = match self.poll_item(task) {
            Ok(item) => item,
            Err(e) => {
                lock(&task.queued).take();
                task.swap_phase(Phase::Scheduled, Phase::Idle);
                return Err(e);
            }
        };
        let ran = self.scheduler.try_execute_now(&item);
        if !matches!(ran, Ok(true)) {
            lock(&task.queued).take();
            task.swap_phase(Phase::Scheduled, Phase::Idle);
            item.dispose();
        }
        ran
    }

    /// Ids of the work items waiting in the queue. On a scheduler driven only
    /// through the adapter these are the pending host task polls.
    pub fn scheduled_tasks(&self) -> Vec<WorkId> {
        self.scheduler
            .enqueued_work_items()
            .into_iter()
            .map(|snapshot| snapshot.id)
            .collect()
    }

    fn submit(&self, task: &Arc<HostTask>) -> Result<()> {
        let result = self
            .poll_item(task)
            .and_then(|item| match self.scheduler.enqueue_item(item.clone()) {
                Ok(()) => Ok(()),
                Err(e) => {
                    lock(&task.queued).take();
                    item.dispose();
                    Err(e)
                }
            });
        if let Err(e) = &result {
            task.complete(TaskStatus::Failed(e.to_string()));
        }
        result
    }

    fn poll_item(&self, task: &Arc<HostTask>) -> Result<WorkItem<()>> {
        let polled = Arc::clone(task);
        let item = WorkItem::fallible(move || polled.run(), self.scheduler.config().due_time())?;

        let id = item.id();
        let watched = Arc::downgrade(task);
        item.on_completed(move |outcome| {
            let Some(task) = watched.upgrade() else {
                return;
            };
            // Canceled before it ran: nothing will poll the task again.
            if matches!(outcome, Outcome::Canceled)
                && task.queued_work() == Some(id)
                && task.phase() == Phase::Scheduled
            {
                task.complete(TaskStatus::Canceled);
            }
        })?;

        *lock(&task.queued) = Some(id);
        Ok(item)
    }
}

impl Spawn for ExecutorAdapter {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> std::result::Result<(), SpawnError> {
        self.spawn(future).map(drop).map_err(|_| SpawnError::shutdown())
    }

    fn status(&self) -> std::result::Result<(), SpawnError> {
        if self.scheduler.is_disposed() {
            Err(SpawnError::shutdown())
        } else {
            Ok(())
        }
    }
}
