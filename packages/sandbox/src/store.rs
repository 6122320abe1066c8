// ABOUTME: Sandbox and container metadata plus the registry used to look them up
// ABOUTME: Includes an in-memory registry that resolves full ids or unique id prefixes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Sandbox not found: {0}")]
    NotFound(String),
    #[error("Id prefix {prefix:?} matches {matches} entries")]
    Ambiguous { prefix: String, matches: usize },
    #[error("Invalid id: {0:?}")]
    InvalidId(String),
    #[error("Id already registered: {0}")]
    Duplicate(String),
}

type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodMetadata {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub attempt: u32,
}

/// Linux namespaces a pod shares with the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOptions {
    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,
}

/// Immutable pod configuration captured when the sandbox was started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub metadata: PodMetadata,
    pub namespace_options: NamespaceOptions,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    /// Network namespace path; `None` when the pod runs on the host network
    pub netns_path: Option<PathBuf>,
    pub config: SandboxConfig,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn uses_host_network(&self) -> bool {
        self.config.namespace_options.host_network
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub sandbox_id: String,
    pub name: String,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

/// Read access to sandbox and container metadata
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a sandbox by id
    async fn get_sandbox(&self, id: &str) -> Result<Sandbox>;

    /// Snapshot of every known container. Containers registered after the
    /// call are not part of the result.
    async fn list_containers(&self) -> Result<Vec<Container>>;
}

/// In-memory registry keyed by full id
#[derive(Clone, Default)]
pub struct MemoryStore {
    sandboxes: Arc<RwLock<HashMap<String, Sandbox>>>,
    containers: Arc<RwLock<HashMap<String, Container>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_sandbox(&self, sandbox: Sandbox) -> Result<()> {
        if sandbox.id.is_empty() {
            return Err(RegistryError::InvalidId(sandbox.id));
        }
        let mut sandboxes = self.sandboxes.write().await;
        if sandboxes.contains_key(&sandbox.id) {
            return Err(RegistryError::Duplicate(sandbox.id));
        }
        sandboxes.insert(sandbox.id.clone(), sandbox);
        Ok(())
    }

    pub async fn remove_sandbox(&self, id: &str) -> Option<Sandbox> {
        let mut sandboxes = self.sandboxes.write().await;
        sandboxes.remove(id)
    }

    pub async fn add_container(&self, container: Container) -> Result<()> {
        if container.id.is_empty() {
            return Err(RegistryError::InvalidId(container.id));
        }
        let mut containers = self.containers.write().await;
        if containers.contains_key(&container.id) {
            return Err(RegistryError::Duplicate(container.id));
        }
        containers.insert(container.id.clone(), container);
        Ok(())
    }

    pub async fn remove_container(&self, id: &str) -> Option<Container> {
        let mut containers = self.containers.write().await;
        containers.remove(id)
    }
}

#[async_trait]
impl Registry for MemoryStore {
    async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        if id.is_empty() {
            return Err(RegistryError::InvalidId(id.to_string()));
        }

        let sandboxes = self.sandboxes.read().await;
        if let Some(sandbox) = sandboxes.get(id) {
            return Ok(sandbox.clone());
        }

        // Fall back to a truncated id
        let mut matches = sandboxes.values().filter(|s| s.id.starts_with(id));
        let first = matches.next();
        let rest = matches.count();
        match (first, rest) {
            (Some(sandbox), 0) => Ok(sandbox.clone()),
            (Some(_), rest) => Err(RegistryError::Ambiguous {
                prefix: id.to_string(),
                matches: rest + 1,
            }),
            (None, _) => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        let containers = self.containers.read().await;
        let mut list: Vec<Container> = containers.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }
}
