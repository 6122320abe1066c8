// ABOUTME: Per-task stop-and-reap primitive shared by containers and sandbox tasks
// ABOUTME: Subscribes to lifecycle events before killing, waits for the matching exit, then deletes

use podshim_runtime::{
    EventService, EventSubscription, KillScope, Signal, StreamError, TaskError, TaskService,
    TaskStatus,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ReapError {
    #[error("Failed to subscribe to task events for {id}: {source}")]
    Subscribe { id: String, source: StreamError },

    #[error("Failed to get task {id}: {source}")]
    Status { id: String, source: TaskError },

    #[error("Failed to kill task {id}: {source}")]
    Kill { id: String, source: TaskError },

    #[error("Failed to wait for task {id} (pid {pid}) to exit: {source}")]
    Wait {
        id: String,
        pid: u32,
        source: StreamError,
    },

    #[error("Timed out after {timeout:?} waiting for task {id} (pid {pid}) to exit")]
    WaitTimeout {
        id: String,
        pid: u32,
        timeout: Duration,
    },

    #[error("Failed to delete task {id}: {source}")]
    Delete { id: String, source: TaskError },
}

pub type Result<T> = std::result::Result<T, ReapError>;

/// Stops a task and reclaims it, tolerating a task that is already on its
/// way out at any point of the sequence.
#[derive(Clone)]
pub struct TaskReaper {
    tasks: Arc<dyn TaskService>,
    events: Arc<dyn EventService>,
}

impl TaskReaper {
    pub fn new(tasks: Arc<dyn TaskService>, events: Arc<dyn EventService>) -> Self {
        Self { tasks, events }
    }

    /// Kill the task with SIGKILL, wait for its exit event and delete it.
    ///
    /// The subscription is taken before anything else so the exit event
    /// cannot slip past the wait. `timeout` bounds only the wait.
    pub async fn stop_and_reap(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let scope = CancellationToken::new();
        let _release = scope.clone().drop_guard();

        let mut subscription =
            self.events
                .subscribe(scope.clone())
                .await
                .map_err(|source| ReapError::Subscribe {
                    id: id.to_string(),
                    source,
                })?;

        match self.tasks.get_task(id).await {
            Ok(task) if task.status == TaskStatus::Stopped => {
                debug!("Task {} already stopped", id);
            }
            Ok(task) => {
                self.kill(id).await?;
                if task.pid == 0 {
                    // Nothing was ever started, so no exit will be reported
                    debug!("Task {} has no process to wait for", id);
                } else {
                    wait_for_exit(&mut subscription, id, task.pid, timeout).await?;
                }
            }
            Err(e) if e.is_not_found() => {
                debug!("Task {} not found", id);
            }
            Err(source) => {
                return Err(ReapError::Status {
                    id: id.to_string(),
                    source,
                })
            }
        }

        match self.tasks.delete_task(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("Task {} already deleted", id),
            Err(source) => {
                return Err(ReapError::Delete {
                    id: id.to_string(),
                    source,
                })
            }
        }

        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<()> {
        match self
            .tasks
            .kill_task(id, Signal::Kill, KillScope::All)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_already_exited() => {
                debug!("Task {} exited before it was killed: {}", id, e);
                Ok(())
            }
            Err(source) => Err(ReapError::Kill {
                id: id.to_string(),
                source,
            }),
        }
    }
}

/// Consume events until the exit of `(id, pid)` arrives
async fn wait_for_exit(
    subscription: &mut EventSubscription,
    id: &str,
    pid: u32,
    timeout: Option<Duration>,
) -> Result<()> {
    let wait = async {
        loop {
            let event = subscription.next().await.map_err(|source| ReapError::Wait {
                id: id.to_string(),
                pid,
                source,
            })?;
            if event.is_exit_of(id, pid) {
                info!("Task {} (pid {}) exited: {:?}", id, pid, event.kind);
                return Ok(());
            }
        }
    };

    match timeout {
        Some(budget) => tokio::time::timeout(budget, wait)
            .await
            .map_err(|_| ReapError::WaitTimeout {
                id: id.to_string(),
                pid,
                timeout: budget,
            })?,
        None => wait.await,
    }
}
