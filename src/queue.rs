//! Closable FIFO blocking queue.
//!
//! Multi-producer, multi-consumer. Besides the pending items the queue
//! counts items that consumers have taken but not yet finished, under the
//! same lock, so `load()` never dips while an item moves from pending to
//! in-flight.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sync::{lock, wait, wait_timeout};

pub struct WorkQueue<I> {
    state: Mutex<QueueState<I>>,
    /// Signalled when an item is added or the queue closes.
    available: Condvar,
    /// Signalled when load drops to zero.
    idle: Condvar,
}

struct QueueState<I> {
    items: VecDeque<I>,
    closed: bool,
    in_flight: usize,
}

impl<I> QueueState<I> {
    fn load(&self) -> usize {
        self.items.len() + self.in_flight
    }
}

impl<I> WorkQueue<I> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                in_flight: 0,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    pub fn add(&self, item: I) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Add every item or none of them.
    pub fn add_all(&self, items: impl IntoIterator<Item = I>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        let before = state.items.len();
        state.items.extend(items);
        let added = state.items.len() - before;
        drop(state);
        for _ in 0..added {
            self.available.notify_one();
        }
        Ok(())
    }

    /// Block until an item is available. `None` once closed and drained.
    ///
    /// The returned item counts as in-flight until [`finish`](Self::finish).
    pub fn take(&self) -> Option<I> {
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = state.items.pop_front() {
                state.in_flight += 1;
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = wait(&self.available, state);
        }
    }

    /// Non-blocking [`take`](Self::take).
    pub fn try_take(&self) -> Option<I> {
        let mut state = lock(&self.state);
        let item = state.items.pop_front()?;
        state.in_flight += 1;
        Some(item)
    }

    /// Count work that runs outside the queue (inline execution) as in-flight.
    pub fn track(&self) {
        lock(&self.state).in_flight += 1;
    }

    /// Release one in-flight slot taken by `take`, `try_take` or `track`.
    pub fn finish(&self) {
        let mut state = lock(&self.state);
        state.in_flight = state.in_flight.saturating_sub(1);
        let idle = state.load() == 0;
        drop(state);
        if idle {
            self.idle.notify_all();
        }
    }

    /// Refuse further adds. Queued items stay drainable.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Closed and nothing left to take.
    pub fn is_completed(&self) -> bool {
        let state = lock(&self.state);
        state.closed && state.items.is_empty()
    }

    /// Pending items.
    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight
    }

    /// Pending plus in-flight.
    pub fn load(&self) -> usize {
        lock(&self.state).load()
    }

    /// Block until load reaches zero. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.load() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = wait_timeout(&self.idle, state, remaining);
        }
        true
    }

    /// Map every pending item, in dequeue order.
    pub fn snapshot<R>(&self, f: impl FnMut(&I) -> R) -> Vec<R> {
        lock(&self.state).items.iter().map(f).collect()
    }

    /// First pending item matching `predicate`. The item stays queued.
    pub fn find(&self, mut predicate: impl FnMut(&I) -> bool) -> Option<I>
    where
        I: Clone,
    {
        lock(&self.state)
            .items
            .iter()
            .find(|item| predicate(item))
            .cloned()
    }
}

impl<I> Default for WorkQueue<I> {
    fn default() -> Self {
        Self::new()
    }
}
