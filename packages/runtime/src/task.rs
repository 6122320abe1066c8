// ABOUTME: Task client trait and task status types for the execution engine
// ABOUTME: Defines the get/kill/delete contract used to stop and reap sandbox and container tasks

use crate::error::TaskError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

type Result<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Running,
    Stopped,
}

/// Runtime view of a task at the moment it was queried
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub status: TaskStatus,
    /// OS process id; reused over time, so it only identifies a process
    /// instance together with the task id.
    pub pid: u32,
    pub exit_code: Option<i64>,
}

/// Signals a task can be stopped with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Kill => "SIGKILL",
        }
    }
}

/// Which processes of a task receive a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillScope {
    /// Only the task's init process
    Single,
    /// Every process in the task's process group
    All,
}

/// Task client for the underlying execution engine.
///
/// Calls against a task that no longer exists return `TaskError::NotFound`.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Fetch the current status, pid and exit code of a task
    async fn get_task(&self, id: &str) -> Result<TaskInfo>;

    /// Deliver a signal to a task. May return `TaskError::AlreadyExited`
    /// when the process finished before the signal landed.
    async fn kill_task(&self, id: &str, signal: Signal, scope: KillScope) -> Result<()>;

    /// Reclaim a stopped task
    async fn delete_task(&self, id: &str) -> Result<()>;
}
