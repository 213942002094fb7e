//! Dispatch engine: admission control, the consumer pool and the scheduler facade.

pub mod admission;
pub mod consumer;
pub mod scheduler;

pub use admission::Capacity;
pub use consumer::{ConsumerPool, ExitStatus, WorkerExit};
pub use scheduler::{Scheduler, SchedulerBuilder};
