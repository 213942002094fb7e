//! Work items.
//!
//! A [`WorkItem`] is a unit of work plus its lifecycle and completion state.
//! It is a cheap handle: clones share the same state, so the scheduler can
//! hold one clone in its queue while the caller keeps another to observe
//! the outcome.
//!
//! Terminal transitions are first-wins. Whichever of completion, fault,
//! explicit cancel, deadline expiry or disposal gets to the state lock first
//! decides the outcome; every later setter is rejected.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use crate::deadline::{self, DeadlineHandle, Expire};
use crate::error::{Error, Result};
use crate::model::{Outcome, State, WorkId, WorkSnapshot};
use crate::sync::{lock, wait_timeout};

pub(crate) type Action<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'static>;
type Continuation<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

/// A schedulable unit of work producing a `T`.
pub struct WorkItem<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    id: WorkId,
    created_at: DateTime<Utc>,
    due_time: Duration,
    deadline: Instant,
    action: Mutex<Option<Action<T>>>,
    core: Mutex<Core<T>>,
    settled: Condvar,
    state_tx: watch::Sender<State>,
}

struct Core<T> {
    state: State,
    outcome: Option<Arc<Outcome<T>>>,
    continuations: Vec<Continuation<T>>,
    disposed: bool,
    deadline: Option<DeadlineHandle>,
}

impl<T> Clone for WorkItem<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> WorkItem<T> {
    /// Wrap an infallible action. Fails if `due_time` is zero.
    pub fn new<F>(action: F, due_time: Duration) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::fallible(move || Ok(action()), due_time)
    }

    /// Wrap an action whose `Err` becomes the item's fault.
    pub fn fallible<F>(action: F, due_time: Duration) -> Result<Self>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::from_action(Box::new(action), due_time)
    }

    pub(crate) fn from_action(action: Action<T>, due_time: Duration) -> Result<Self> {
        if due_time.is_zero() {
            return Err(Error::InvalidArgument(
                "due time must be greater than zero".to_string(),
            ));
        }
        let deadline = Instant::now()
            .checked_add(due_time)
            .ok_or_else(|| Error::InvalidArgument(format!("due time {due_time:?} is too large")))?;

        let (state_tx, _) = watch::channel(State::Created);
        let shared = Arc::new(Shared {
            id: WorkId::new(),
            created_at: Utc::now(),
            due_time,
            deadline,
            action: Mutex::new(Some(action)),
            core: Mutex::new(Core {
                state: State::Created,
                outcome: None,
                continuations: Vec::new(),
                disposed: false,
                deadline: None,
            }),
            settled: Condvar::new(),
            state_tx,
        });

        let weak: Weak<Shared<T>> = Arc::downgrade(&shared);
        let target: Weak<dyn Expire> = weak;
        let handle = deadline::shared().arm(deadline, target)?;

        {
            let mut core = lock(&shared.core);
            if core.state.is_terminal() {
                // Expired before we could store the handle.
                handle.disarm();
            } else {
                core.deadline = Some(handle);
            }
        }

        Ok(Self { shared })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn id(&self) -> WorkId {
        self.shared.id
    }

    pub fn state(&self) -> State {
        self.shared.refresh().state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    pub fn due_time(&self) -> Duration {
        self.shared.due_time
    }

    /// Wall-clock time at which the deadline fires.
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.shared.due_time)
            .ok()
            .and_then(|due| self.shared.created_at.checked_add_signed(due))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Not terminal, not disposed, and not past its deadline.
    pub fn is_valid(&self) -> bool {
        let core = self.shared.refresh();
        !core.disposed && !core.state.is_terminal()
    }

    /// Valid, not yet picked up, and still holding its action.
    pub fn is_runnable(&self) -> bool {
        let core = self.shared.refresh();
        !core.disposed
            && matches!(core.state, State::Created | State::Queued)
            && lock(&self.shared.action).is_some()
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == State::Canceled
    }

    /// Completed successfully.
    pub fn is_completed(&self) -> bool {
        self.state() == State::Completed
    }

    pub fn is_faulted(&self) -> bool {
        self.state() == State::Faulted
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.core).disposed
    }

    /// The stored outcome, once terminal and until disposed.
    pub fn outcome(&self) -> Option<Arc<Outcome<T>>> {
        self.shared.refresh().outcome.clone()
    }

    pub fn snapshot(&self) -> WorkSnapshot {
        WorkSnapshot {
            id: self.id(),
            state: self.state(),
            created_at: self.created_at(),
            expires_at: self.expires_at(),
            due_time_ms: self.shared.due_time.as_millis() as u64,
        }
    }

    // -----------------------------------------------------------------------
    // Terminal setters
    // -----------------------------------------------------------------------

    pub fn cancel(&self) -> Result<()> {
        let core = self.shared.refresh();
        if core.disposed {
            return Err(Error::Disposed("work item"));
        }
        if core.state.is_terminal() {
            return Err(Error::InvalidState {
                id: self.shared.id,
                state: core.state,
            });
        }
        debug!(id = %self.shared.id, "work item canceled");
        self.shared.finish(core, Outcome::Canceled);
        Ok(())
    }

    /// Complete with `value`. A cancellation that already happened wins.
    pub fn set_result(&self, value: T) -> Result<()> {
        self.settle(Outcome::Completed(value))
    }

    /// Fault with `message`. A cancellation that already happened wins.
    pub fn set_exception(&self, message: impl Into<String>) -> Result<()> {
        self.settle(Outcome::Faulted(message.into()))
    }

    fn settle(&self, outcome: Outcome<T>) -> Result<()> {
        let core = self.shared.refresh();
        if core.disposed {
            return Err(Error::Disposed("work item"));
        }
        match core.state {
            State::Canceled => Err(Error::OperationCanceled { id: self.shared.id }),
            state if state.is_terminal() => Err(Error::InvalidState {
                id: self.shared.id,
                state,
            }),
            _ => {
                self.shared.finish(core, outcome);
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Await contract
    // -----------------------------------------------------------------------

    /// Run `continuation` once the item is terminal; immediately if it already is.
    pub fn on_completed<F>(&self, continuation: F) -> Result<()>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let mut core = self.shared.refresh();
        if core.disposed {
            return Err(Error::Disposed("work item"));
        }
        match core.outcome.clone() {
            Some(outcome) => {
                drop(core);
                continuation(&outcome);
            }
            None => core.continuations.push(Box::new(continuation)),
        }
        Ok(())
    }

    /// Suspend the calling task until the item is terminal.
    ///
    /// Only the awaiting task is suspended; no thread is blocked.
    pub async fn wait(&self) -> Result<T>
    where
        T: Clone,
    {
        let mut rx = self.shared.state_tx.subscribe();
        drop(self.shared.refresh());
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|e| Error::Other(format!("work item state channel closed: {e}")))?;
        self.observe()
    }

    /// Park the calling thread until the item is terminal.
    pub fn wait_blocking(&self) -> Result<T>
    where
        T: Clone,
    {
        let mut core = self.shared.refresh();
        while !core.disposed && !core.state.is_terminal() {
            let remaining = self.shared.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                drop(core);
                core = self.shared.refresh();
                continue;
            }
            core = wait_timeout(&self.shared.settled, core, remaining);
        }
        drop(core);
        self.observe()
    }

    fn observe(&self) -> Result<T>
    where
        T: Clone,
    {
        let core = self.shared.refresh();
        if core.disposed {
            return Err(Error::Disposed("work item"));
        }
        match core.outcome.as_deref() {
            Some(Outcome::Completed(value)) => Ok(value.clone()),
            Some(Outcome::Faulted(message)) => Err(Error::ExecutionFault {
                id: self.shared.id,
                message: message.clone(),
            }),
            Some(Outcome::Canceled) => Err(Error::OperationCanceled { id: self.shared.id }),
            None => Err(Error::InvalidState {
                id: self.shared.id,
                state: core.state,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Disposal
    // -----------------------------------------------------------------------

    /// Idempotent. A pending item is canceled first so nothing waits on it forever.
    pub fn dispose(&self) {
        let mut core = lock(&self.shared.core);
        if core.disposed {
            return;
        }
        if !core.state.is_terminal() {
            self.shared.finish(core, Outcome::Canceled);
            core = lock(&self.shared.core);
        }
        core.disposed = true;
        core.outcome = None;
        if let Some(handle) = core.deadline.take() {
            handle.disarm();
        }
        drop(core);

        lock(&self.shared.action).take();
        self.shared.settled.notify_all();
        debug!(id = %self.shared.id, "work item disposed");
    }

    // -----------------------------------------------------------------------
    // Dispatch hooks
    // -----------------------------------------------------------------------

    /// Created -> Queued on admission.
    pub(crate) fn mark_queued(&self) -> Result<()> {
        let mut core = self.shared.refresh();
        if core.disposed {
            return Err(Error::Disposed("work item"));
        }
        match core.state {
            State::Created => {
                core.state = State::Queued;
                self.shared.state_tx.send_replace(State::Queued);
                Ok(())
            }
            State::Queued | State::Running => Err(Error::InvalidState {
                id: self.shared.id,
                state: core.state,
            }),
            // Admitted as-is; the consumer skips it.
            _ => Ok(()),
        }
    }

    /// Queued -> Created for an item whose batch never reached the queue.
    pub(crate) fn unmark_queued(&self) {
        let core = &mut *lock(&self.shared.core);
        if !core.disposed && core.state == State::Queued {
            core.state = State::Created;
            self.shared.state_tx.send_replace(State::Created);
        }
    }

    /// Cancel an item still waiting for dispatch. Running or terminal items
    /// belong to whoever claimed them and are left alone.
    pub(crate) fn cancel_pending(&self) -> bool {
        let core = self.shared.refresh();
        if core.disposed || !matches!(core.state, State::Created | State::Queued) {
            return false;
        }
        debug!(id = %self.shared.id, "work item canceled");
        self.shared.finish(core, Outcome::Canceled);
        true
    }

    /// Take exclusive ownership of the action, moving the item to Running.
    ///
    /// Returns `None` when the item is not runnable, which also guarantees
    /// that at most one caller ever executes the action.
    pub(crate) fn begin(&self) -> Option<Action<T>> {
        let mut core = self.shared.refresh();
        if core.disposed || !core.state.can_transition_to(State::Running) {
            return None;
        }
        let action = lock(&self.shared.action).take()?;
        core.state = State::Running;
        self.shared.state_tx.send_replace(State::Running);
        Some(action)
    }

    /// Record what the action produced. Rejections (deadline won, disposed
    /// mid-flight) are returned for logging only.
    pub(crate) fn conclude(&self, result: std::result::Result<T, String>) -> Result<()> {
        match result {
            Ok(value) => self.set_result(value),
            Err(message) => self.set_exception(message),
        }
    }

    /// Release what the dispatcher held: the deadline and any unexecuted action.
    pub(crate) fn retire(&self) {
        if let Some(handle) = lock(&self.shared.core).deadline.take() {
            handle.disarm();
        }
        lock(&self.shared.action).take();
    }
}

impl<T: Send + Sync + 'static> Shared<T> {
    /// Lock the core, applying a deadline that passed before the timer thread noticed.
    fn refresh(&self) -> MutexGuard<'_, Core<T>> {
        let core = lock(&self.core);
        if core.disposed || core.state.is_terminal() || Instant::now() < self.deadline {
            return core;
        }
        debug!(id = %self.id, "deadline passed, canceling work item");
        self.finish(core, Outcome::Canceled);
        lock(&self.core)
    }

    /// Apply a terminal outcome to a non-terminal item and release its observers.
    fn finish(&self, mut core: MutexGuard<'_, Core<T>>, outcome: Outcome<T>) {
        let state = outcome.state();
        let outcome = Arc::new(outcome);
        core.state = state;
        core.outcome = Some(Arc::clone(&outcome));
        if let Some(handle) = core.deadline.take() {
            handle.disarm();
        }
        let continuations = std::mem::take(&mut core.continuations);
        self.state_tx.send_replace(state);
        drop(core);

        self.settled.notify_all();
        for continuation in continuations {
            continuation(&outcome);
        }
    }
}

impl<T: Send + Sync + 'static> Expire for Shared<T> {
    fn expire(&self) {
        let core = lock(&self.core);
        if core.disposed || core.state.is_terminal() {
            return;
        }
        debug!(id = %self.id, "deadline fired, canceling work item");
        self.finish(core, Outcome::Canceled);
    }
}

impl<T> fmt::Debug for WorkItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock(&self.shared.core);
        f.debug_struct("WorkItem")
            .field("id", &self.shared.id)
            .field("state", &core.state)
            .field("disposed", &core.disposed)
            .field("due_time", &self.shared.due_time)
            .finish()
    }
}

/// Run an action, turning both `Err` and panics into a fault message.
pub(crate) fn invoke<T>(action: Action<T>) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("action panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("action panicked: {message}")
    } else {
        "action panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn item(due: Duration) -> WorkItem<u32> {
        WorkItem::new(|| 7, due).unwrap()
    }

    #[test]
    fn begin_hands_out_the_action_once() {
        let work = item(Duration::from_secs(5));
        let action = work.begin().expect("first begin gets the action");
        assert_eq!(work.state(), State::Running);
        assert!(work.begin().is_none());
        assert!(!work.is_runnable());

        work.conclude(invoke(action)).unwrap();
        assert!(work.is_completed());
    }

    #[test]
    fn cancel_pending_leaves_a_running_item_alone() {
        let queued = item(Duration::from_secs(5));
        queued.mark_queued().unwrap();
        assert!(queued.cancel_pending());
        assert!(queued.is_canceled());

        let running = item(Duration::from_secs(5));
        let action = running.begin().unwrap();
        assert!(!running.cancel_pending());
        assert_eq!(running.state(), State::Running);
        running.conclude(invoke(action)).unwrap();
        assert!(running.is_completed());
    }

    #[test]
    fn unmark_queued_only_reverts_queued_items() {
        let work = item(Duration::from_secs(5));
        work.mark_queued().unwrap();
        work.unmark_queued();
        assert_eq!(work.state(), State::Created);
        work.mark_queued().unwrap();

        let done = item(Duration::from_secs(5));
        done.cancel().unwrap();
        done.unmark_queued();
        assert!(done.is_canceled());
    }

    #[test]
    fn past_deadline_is_applied_on_query() {
        let work = item(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(40));
        // Whether the timer thread or the query got there first, the item is canceled.
        assert!(!work.is_valid());
        assert!(work.is_canceled());
        assert!(work.begin().is_none());
    }

    #[test]
    fn invoke_captures_errors_and_panics() {
        let failing: Action<u32> = Box::new(|| Err(anyhow::anyhow!("boom")));
        assert_eq!(invoke(failing), Err("boom".to_string()));

        let panicking: Action<u32> = Box::new(|| panic!("kaboom"));
        let message = invoke(panicking).unwrap_err();
        assert!(message.contains("kaboom"), "{message}");
    }

    #[test]
    fn continuations_run_exactly_once() {
        let work = item(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));

        let before = Arc::clone(&calls);
        work.on_completed(move |_| {
            before.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        work.set_result(1).unwrap();
        assert!(work.set_result(2).is_err());

        let after = Arc::clone(&calls);
        work.on_completed(move |outcome| {
            assert_eq!(outcome.value(), Some(&1));
            after.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retire_leaves_the_outcome_observable() {
        let work = item(Duration::from_secs(5));
        let action = work.begin().unwrap();
        work.conclude(invoke(action)).unwrap();
        work.retire();
        assert_eq!(work.wait_blocking().unwrap(), 7);
    }
}
