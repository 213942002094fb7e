//! Error types for workq.

use thiserror::Error;

use crate::model::{State, WorkId};

#[derive(Debug, Error)]
pub enum Error {
    /// Zero due-time, zero consumer count, empty batch and similar caller mistakes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("maximum work item queue count reached {max}")]
    CapacityExceeded { max: usize },

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// A terminal setter or cancel raced with an earlier terminal transition.
    #[error("work item {id} is already terminal ({state})")]
    InvalidState { id: WorkId, state: State },

    #[error("work item {id} faulted: {message}")]
    ExecutionFault { id: WorkId, message: String },

    #[error("work item {id} was canceled")]
    OperationCanceled { id: WorkId },

    #[error("work queue is closed for adding")]
    AlreadyClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for deadline expiry or explicit cancellation, as opposed to a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::OperationCanceled { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
