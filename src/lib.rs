//! # workq
//!
//! Bounded-concurrency work scheduler.
//!
//! A fixed pool of consumer threads drains a FIFO queue of work items.
//! Admission is bounded by an optional capacity, every item carries a
//! deadline after which it is canceled, and outcomes can be observed by
//! callback, by awaiting, or by blocking. [`executor::ExecutorAdapter`]
//! runs ordinary futures on the same pool.

pub mod config;
pub(crate) mod deadline;
pub mod engine;
pub mod error;
pub mod executor;
pub mod item;
pub mod model;
pub mod queue;
pub(crate) mod sync;
pub mod telemetry;

pub use config::SchedulerConfig;
pub use engine::{Scheduler, SchedulerBuilder};
pub use error::{Error, Result};
pub use executor::{ExecutorAdapter, HostTask, TaskHandle};
pub use item::WorkItem;
pub use model::{Outcome, State, WorkId, WorkOptions, WorkSnapshot};
