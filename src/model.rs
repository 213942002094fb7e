//! Core data model.
//!
//! Identity, lifecycle state and outcome of a work item, plus the
//! per-item options accepted by the scheduler and the read-only snapshot
//! it hands out for diagnostics.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Built, not yet handed to a scheduler.
    Created,
    /// Admitted, waiting for a consumer.
    Queued,
    /// A consumer (or an inline caller) owns the action.
    Running,
    /// Action returned normally. Terminal.
    Completed,
    /// Action returned an error or panicked. Terminal.
    Faulted,
    /// Deadline fired, explicit cancel, or disposed before finishing. Terminal.
    Canceled,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        match (self, to) {
            (Created, Queued) => true,
            (Created | Queued, Running) => true,
            (from, Completed | Faulted | Canceled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Faulted | State::Canceled)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Created => "created",
            State::Queued => "queued",
            State::Running => "running",
            State::Completed => "completed",
            State::Faulted => "faulted",
            State::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a work item ended. Written at most once.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    /// Rendered error or panic message from the action.
    Faulted(String),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn state(&self) -> State {
        match self {
            Outcome::Completed(_) => State::Completed,
            Outcome::Faulted(_) => State::Faulted,
            Outcome::Canceled => State::Canceled,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Callback run on the worker with the action's value, before the item turns terminal.
pub type Callback<T> = Box<dyn FnOnce(&T) + Send + 'static>;

/// Per-item options for `Scheduler::enqueue_with_options` and friends.
pub struct WorkOptions<T> {
    pub(crate) due_time: Option<Duration>,
    pub(crate) callback: Option<Callback<T>>,
}

impl<T> WorkOptions<T> {
    pub fn new() -> Self {
        Self {
            due_time: None,
            callback: None,
        }
    }

    /// Override the scheduler's configured due-time for this item.
    pub fn due_time(mut self, due_time: Duration) -> Self {
        self.due_time = Some(due_time);
        self
    }

    pub fn callback(mut self, callback: impl FnOnce(&T) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl<T> Default for WorkOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for WorkOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkOptions")
            .field("due_time", &self.due_time)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of a queued work item, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSnapshot {
    pub id: WorkId,
    pub state: State,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub due_time_ms: u64,
}
