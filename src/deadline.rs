//! Shared deadline timer.
//!
//! A single background thread sleeps until the earliest armed deadline and
//! then expires every target whose deadline has passed. Targets are held
//! weakly, so a dropped work item never stays alive just because its timer
//! is still pending.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread;
use std::time::Instant;

use tracing::{debug, error};

use crate::error::Result;
use crate::sync::{lock, wait, wait_timeout};

/// Heap size above which disarmed entries are pruned eagerly.
const PRUNE_THRESHOLD: usize = 1024;

/// Something that can be expired by the timer thread.
pub(crate) trait Expire: Send + Sync {
    fn expire(&self);
}

/// An armed deadline.
struct TimerEntry {
    deadline: Instant,
    target: Weak<dyn Expire>,
    disarmed: Arc<AtomicBool>,
}

impl TimerEntry {
    fn is_disarmed(&self) -> bool {
        self.disarmed.load(AtomicOrdering::Acquire)
    }
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    /// Reversed so that `BinaryHeap<TimerEntry>` pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Disarms its deadline when asked; dropping it leaves the deadline armed.
#[derive(Debug)]
pub(crate) struct DeadlineHandle {
    disarmed: Arc<AtomicBool>,
}

impl DeadlineHandle {
    pub(crate) fn disarm(&self) {
        self.disarmed.store(true, AtomicOrdering::Release);
    }
}

struct TimerState {
    entries: BinaryHeap<TimerEntry>,
    running: bool,
}

pub(crate) struct DeadlineTimer {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

static SHARED: OnceLock<Arc<DeadlineTimer>> = OnceLock::new();

/// The process-wide timer used by work items. Its thread starts on first use.
pub(crate) fn shared() -> Arc<DeadlineTimer> {
    Arc::clone(SHARED.get_or_init(|| Arc::new(DeadlineTimer::new())))
}

impl DeadlineTimer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                running: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Arm a deadline for `target`, starting the timer thread if needed.
    pub(crate) fn arm(
        self: &Arc<Self>,
        deadline: Instant,
        target: Weak<dyn Expire>,
    ) -> Result<DeadlineHandle> {
        let disarmed = Arc::new(AtomicBool::new(false));

        let mut state = lock(&self.state);
        if !state.running {
            let timer = Arc::clone(self);
            thread::Builder::new()
                .name("workq-deadline".to_string())
                .spawn(move || timer.run())?;
            state.running = true;
            debug!("deadline timer thread started");
        }

        if state.entries.len() > PRUNE_THRESHOLD {
            state.entries.retain(|entry| !entry.is_disarmed());
        }

        let earliest = state
            .entries
            .peek()
            .is_none_or(|entry| deadline < entry.deadline);
        state.entries.push(TimerEntry {
            deadline,
            target,
            disarmed: Arc::clone(&disarmed),
        });
        drop(state);

        if earliest {
            self.wakeup.notify_one();
        }

        Ok(DeadlineHandle { disarmed })
    }

    /// Number of entries still in the heap, disarmed ones included.
    #[cfg(test)]
    fn armed(&self) -> usize {
        lock(&self.state).entries.len()
    }

    fn run(&self) {
        let mut state = lock(&self.state);
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            while state.entries.peek().is_some_and(|entry| entry.deadline <= now) {
                if let Some(entry) = state.entries.pop() {
                    if !entry.is_disarmed() {
                        due.push(entry.target);
                    }
                }
            }

            if !due.is_empty() {
                // Expiry runs user continuations; never hold the heap lock across it.
                drop(state);
                for target in due {
                    let Some(target) = target.upgrade() else {
                        continue;
                    };
                    if panic::catch_unwind(AssertUnwindSafe(|| target.expire())).is_err() {
                        error!("work item continuation panicked during deadline expiry");
                    }
                }
                state = lock(&self.state);
                continue;
            }

            state = match state.entries.peek().map(|entry| entry.deadline) {
                Some(deadline) => {
                    wait_timeout(&self.wakeup, state, deadline.saturating_duration_since(now))
                }
                None => wait(&self.wakeup, state),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counter(AtomicUsize);

    impl Expire for Counter {
        fn expire(&self) {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn target() -> (Arc<Counter>, Weak<dyn Expire>) {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let as_dyn: Arc<dyn Expire> = counter.clone();
        (counter, Arc::downgrade(&as_dyn))
    }

    #[test]
    fn fires_after_deadline() {
        let timer = Arc::new(DeadlineTimer::new());
        let (counter, weak) = target();

        let _handle = timer
            .arm(Instant::now() + Duration::from_millis(50), weak)
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.0.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(timer.armed(), 0);
    }

    #[test]
    fn disarmed_deadline_never_fires() {
        let timer = Arc::new(DeadlineTimer::new());
        let (counter, weak) = target();

        let handle = timer
            .arm(Instant::now() + Duration::from_millis(50), weak)
            .unwrap();
        handle.disarm();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(counter.0.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn earlier_deadline_preempts_a_sleeping_timer() {
        let timer = Arc::new(DeadlineTimer::new());
        let (late, late_weak) = target();
        let (early, early_weak) = target();

        let _late = timer
            .arm(Instant::now() + Duration::from_secs(30), late_weak)
            .unwrap();
        let _early = timer
            .arm(Instant::now() + Duration::from_millis(50), early_weak)
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(early.0.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(late.0.load(AtomicOrdering::SeqCst), 0);
    }
}
