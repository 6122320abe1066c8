// ABOUTME: Error types returned by the task client and the lifecycle event stream
// ABOUTME: Closed error kinds so callers classify failures by variant instead of message text

use thiserror::Error;

/// Failure of a task client call.
///
/// `NotFound` and `AlreadyExited` describe a task that is already on its way
/// out; whether they are fatal is up to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task process already finished: {0}")]
    AlreadyExited(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl TaskError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TaskError::NotFound(_))
    }

    pub fn is_already_exited(&self) -> bool {
        matches!(self, TaskError::AlreadyExited(_))
    }
}

/// Termination reason of an event subscription.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Event subscription cancelled")]
    Cancelled,

    #[error("Event stream closed")]
    Closed,

    #[error("Event stream error: {0}")]
    Runtime(String),
}
