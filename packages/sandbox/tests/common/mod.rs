// ABOUTME: Test doubles for sandbox termination tests
// ABOUTME: Fake execution engine publishing exit events through an EventHub, plus mockall collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use mockall::mock;
use podshim_runtime::{
    EventHub, EventService, EventSubscription, KillScope, LifecycleEvent, Signal, StreamError,
    TaskError, TaskInfo, TaskService, TaskStatus,
};
use podshim_sandbox::{
    Container, ContainerState, Filesystem, MemoryStore, MountError, NamespaceOptions,
    NetworkError, NetworkPlugin, PodMetadata, Sandbox, SandboxConfig, SandboxState,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a fake task reacts to a kill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillBehavior {
    /// Stop and report the exit shortly after the kill returns
    Exit,
    /// The process exits on its own just before the signal lands
    AlreadyExited,
    /// The task vanishes just before the signal lands
    NotFound,
    /// Kill fails with a runtime error
    Fail,
}

#[derive(Debug, Clone)]
struct FakeTask {
    pid: u32,
    status: TaskStatus,
    kill: KillBehavior,
}

/// Recorded task client call; `subscribers` is the number of live event
/// subscriptions at the time of a kill
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(String),
    Kill { id: String, subscribers: usize },
    Delete(String),
}

/// In-memory execution engine
pub struct FakeRuntime {
    hub: EventHub,
    tasks: Mutex<HashMap<String, FakeTask>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(),
            tasks: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn add_running(&self, id: &str, pid: u32) {
        self.add_task(id, pid, TaskStatus::Running, KillBehavior::Exit);
    }

    pub fn add_task(&self, id: &str, pid: u32, status: TaskStatus, kill: KillBehavior) {
        self.tasks
            .lock()
            .unwrap()
            .insert(id.to_string(), FakeTask { pid, status, kill });
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.lock().unwrap().get(id).map(|t| t.status)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn kills(&self, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Kill { id: killed, .. } if killed == id))
            .count()
    }

    pub fn deleted(&self, id: &str) -> bool {
        self.calls()
            .iter()
            .any(|call| matches!(call, Call::Delete(deleted) if deleted == id))
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn mark_stopped(&self, id: &str) -> Option<u32> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(id)?;
        if task.status == TaskStatus::Stopped {
            return None;
        }
        task.status = TaskStatus::Stopped;
        Some(task.pid)
    }

    fn remove(&self, id: &str) {
        self.tasks.lock().unwrap().remove(id);
    }
}

#[async_trait]
impl TaskService for FakeRuntime {
    async fn get_task(&self, id: &str) -> Result<TaskInfo, TaskError> {
        self.record(Call::Get(id.to_string()));
        let tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        Ok(TaskInfo {
            id: id.to_string(),
            status: task.status,
            pid: task.pid,
            exit_code: (task.status == TaskStatus::Stopped).then_some(137),
        })
    }

    async fn kill_task(&self, id: &str, signal: Signal, scope: KillScope) -> Result<(), TaskError> {
        assert_eq!(signal, Signal::Kill);
        assert_eq!(scope, KillScope::All);

        let subscribers = self.hub.subscriber_count().await;
        self.record(Call::Kill {
            id: id.to_string(),
            subscribers,
        });

        let behavior = self
            .tasks
            .lock()
            .unwrap()
            .get(id)
            .map(|t| t.kill)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        match behavior {
            KillBehavior::Exit => {
                if let Some(pid) = self.mark_stopped(id) {
                    let hub = self.hub.clone();
                    let id = id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        hub.publish(LifecycleEvent::task_exit(id, pid, Some(137)))
                            .await;
                    });
                }
                Ok(())
            }
            KillBehavior::AlreadyExited => {
                if let Some(pid) = self.mark_stopped(id) {
                    self.hub
                        .publish(LifecycleEvent::task_exit(id, pid, Some(0)))
                        .await;
                }
                Err(TaskError::AlreadyExited(id.to_string()))
            }
            KillBehavior::NotFound => {
                if let Some(pid) = self.mark_stopped(id) {
                    self.hub
                        .publish(LifecycleEvent::task_exit(id, pid, Some(0)))
                        .await;
                }
                self.remove(id);
                Err(TaskError::NotFound(id.to_string()))
            }
            KillBehavior::Fail => Err(TaskError::Runtime("operation not permitted".to_string())),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<(), TaskError> {
        self.record(Call::Delete(id.to_string()));
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get(id) {
            None => Err(TaskError::NotFound(id.to_string())),
            Some(task) if task.status != TaskStatus::Stopped => {
                Err(TaskError::Runtime(format!("task {} is still running", id)))
            }
            Some(_) => {
                tasks.remove(id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventService for FakeRuntime {
    async fn subscribe(&self, cancel: CancellationToken) -> Result<EventSubscription, StreamError> {
        self.hub.subscribe(cancel).await
    }
}

mock! {
    pub Network {}

    #[async_trait]
    impl NetworkPlugin for Network {
        async fn tear_down_pod(
            &self,
            netns_path: &Path,
            namespace: &str,
            name: &str,
            sandbox_id: &str,
        ) -> Result<(), NetworkError>;
    }
}

mock! {
    pub Fs {}

    #[async_trait]
    impl Filesystem for Fs {
        async fn path_exists(&self, path: &Path) -> std::io::Result<bool>;
        async fn unmount_all(
            &self,
            sandbox_root: &Path,
            config: &SandboxConfig,
        ) -> Result<(), MountError>;
    }
}

pub const NETNS: &str = "/var/run/netns/cni-s1";

pub fn sandbox(id: &str, host_network: bool) -> Sandbox {
    Sandbox {
        id: id.to_string(),
        netns_path: (!host_network).then(|| PathBuf::from(NETNS)),
        config: SandboxConfig {
            metadata: PodMetadata {
                name: "web".to_string(),
                namespace: "default".to_string(),
                uid: "uid-1".to_string(),
                attempt: 0,
            },
            namespace_options: NamespaceOptions {
                host_network,
                ..Default::default()
            },
            labels: HashMap::new(),
        },
        state: SandboxState::Ready,
        created_at: Utc::now(),
    }
}

pub fn container(id: &str, sandbox_id: &str) -> Container {
    Container {
        id: id.to_string(),
        sandbox_id: sandbox_id.to_string(),
        name: format!("{}-name", id),
        state: ContainerState::Running,
        created_at: Utc::now(),
    }
}

/// Registry holding sandbox `s1` with running containers `c1` and `c2`,
/// plus container `other` that belongs to a different sandbox
pub async fn populated_store(host_network: bool) -> MemoryStore {
    let store = MemoryStore::new();
    store.add_sandbox(sandbox("s1", host_network)).await.unwrap();
    store.add_container(container("c1", "s1")).await.unwrap();
    store.add_container(container("c2", "s1")).await.unwrap();
    store.add_container(container("other", "s2")).await.unwrap();
    store
}

pub fn running_runtime() -> FakeRuntime {
    let runtime = FakeRuntime::new();
    runtime.add_running("c1", 101);
    runtime.add_running("c2", 102);
    runtime.add_running("other", 201);
    runtime.add_running("s1", 100);
    runtime
}
