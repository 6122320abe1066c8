// ABOUTME: Sandbox termination orchestrator coordinating registry, tasks, network and mounts
// ABOUTME: Stops member containers, tears down the pod network, unmounts files, reaps the sandbox task

use crate::config::ShimConfig;
use crate::mounts::{sandbox_root_dir, Filesystem, HostFilesystem, MountError};
use crate::network::{CniPlugin, NetworkError, NetworkPlugin};
use crate::reaper::{ReapError, TaskReaper};
use crate::store::{Registry, RegistryError, Sandbox};
use podshim_runtime::{DockerRuntime, EventService, TaskError, TaskService};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StopError {
    #[error("Failed to find sandbox {id:?}: {source}")]
    SandboxLookup { id: String, source: RegistryError },

    #[error("Failed to list containers of sandbox {id:?}: {source}")]
    ListContainers { id: String, source: RegistryError },

    #[error("Failed to stop container {container_id:?}: {source}")]
    Container {
        container_id: String,
        source: ReapError,
    },

    #[error("Failed to stat netns path {path} for sandbox {id:?} before tearing down the network: {source}")]
    NetnsStat {
        id: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to destroy network for sandbox {id:?}: {source}")]
    Network { id: String, source: NetworkError },

    #[error("Failed to unmount sandbox files in {root}: {source}")]
    Mounts { root: PathBuf, source: MountError },

    #[error("Failed to stop sandbox task {id:?}: {source}")]
    SandboxTask { id: String, source: ReapError },
}

/// Sub-step of a sandbox stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopStep {
    Lookup,
    Container(String),
    Network,
    Mounts,
    SandboxTask,
}

impl fmt::Display for StopStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopStep::Lookup => write!(f, "lookup"),
            StopStep::Container(id) => write!(f, "container {}", id),
            StopStep::Network => write!(f, "network"),
            StopStep::Mounts => write!(f, "mounts"),
            StopStep::SandboxTask => write!(f, "sandbox task"),
        }
    }
}

impl StopError {
    /// The sub-step that failed
    pub fn step(&self) -> StopStep {
        match self {
            StopError::SandboxLookup { .. } | StopError::ListContainers { .. } => StopStep::Lookup,
            StopError::Container { container_id, .. } => StopStep::Container(container_id.clone()),
            StopError::NetnsStat { .. } | StopError::Network { .. } => StopStep::Network,
            StopError::Mounts { .. } => StopStep::Mounts,
            StopError::SandboxTask { .. } => StopStep::SandboxTask,
        }
    }
}

pub type Result<T> = std::result::Result<T, StopError>;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Execution engine unavailable: {0}")]
    Runtime(#[from] TaskError),
    #[error("Network plugin unavailable: {0}")]
    Network(#[from] NetworkError),
}

/// Sandbox lifecycle manager.
///
/// Every step of a stop tolerates resuming from a partially completed
/// earlier attempt, so callers recover from a failure by calling
/// `stop_pod_sandbox` again.
pub struct SandboxManager {
    registry: Arc<dyn Registry>,
    network: Arc<dyn NetworkPlugin>,
    filesystem: Arc<dyn Filesystem>,
    reaper: TaskReaper,
    root_dir: PathBuf,
    task_wait_timeout: Option<Duration>,
}

impl SandboxManager {
    pub fn new(
        registry: Arc<dyn Registry>,
        tasks: Arc<dyn TaskService>,
        events: Arc<dyn EventService>,
        network: Arc<dyn NetworkPlugin>,
        filesystem: Arc<dyn Filesystem>,
    ) -> Self {
        Self {
            registry,
            network,
            filesystem,
            reaper: TaskReaper::new(tasks, events),
            root_dir: PathBuf::from(podshim_config::constants::DEFAULT_ROOT_DIR),
            task_wait_timeout: None,
        }
    }

    /// Wire the Docker engine, the configured CNI network and the host
    /// filesystem. Must be called inside a Tokio runtime.
    pub fn with_docker(
        config: &ShimConfig,
        registry: Arc<dyn Registry>,
    ) -> std::result::Result<Self, SetupError> {
        let runtime = Arc::new(DockerRuntime::connect()?);
        let network = CniPlugin::load(
            &config.cni_conf_file,
            config.cni_bin_dirs.clone(),
            &config.cni_ifname,
        )?;

        Ok(Self::new(
            registry,
            runtime.clone(),
            runtime,
            Arc::new(network),
            Arc::new(HostFilesystem::new()),
        )
        .with_config(config))
    }

    /// Apply state layout and wait budget from configuration
    pub fn with_config(mut self, config: &ShimConfig) -> Self {
        self.root_dir = config.root_dir.clone();
        self.task_wait_timeout = config.task_wait_timeout;
        self
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    pub fn with_task_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_wait_timeout = timeout;
        self
    }

    /// Stop a pod sandbox. Running containers inside it are terminated
    /// forcibly.
    pub async fn stop_pod_sandbox(&self, sandbox_id: &str) -> Result<()> {
        info!("StopPodSandbox for sandbox {:?}", sandbox_id);

        let sandbox = self
            .registry
            .get_sandbox(sandbox_id)
            .await
            .map_err(|source| StopError::SandboxLookup {
                id: sandbox_id.to_string(),
                source,
            })?;
        // Later steps use the full id
        let id = sandbox.id.as_str();

        self.stop_containers(id).await?;
        self.teardown_network(&sandbox).await?;

        let sandbox_root = sandbox_root_dir(&self.root_dir, id);
        self.filesystem
            .unmount_all(&sandbox_root, &sandbox.config)
            .await
            .map_err(|source| StopError::Mounts {
                root: sandbox_root.clone(),
                source,
            })?;

        self.reaper
            .stop_and_reap(id, self.task_wait_timeout)
            .await
            .map_err(|source| StopError::SandboxTask {
                id: id.to_string(),
                source,
            })?;

        info!("StopPodSandbox {:?} returns successfully", id);
        Ok(())
    }

    /// Forcibly stop every container of the sandbox, in listing order.
    ///
    /// The listing is a snapshot: containers registered after it are not
    /// stopped by this call.
    async fn stop_containers(&self, sandbox_id: &str) -> Result<()> {
        let containers = self
            .registry
            .list_containers()
            .await
            .map_err(|source| StopError::ListContainers {
                id: sandbox_id.to_string(),
                source,
            })?;

        for container in containers.iter().filter(|c| c.sandbox_id == sandbox_id) {
            debug!(
                "Stopping container {} of sandbox {}",
                container.id, sandbox_id
            );
            self.reaper
                .stop_and_reap(&container.id, self.task_wait_timeout)
                .await
                .map_err(|source| StopError::Container {
                    container_id: container.id.clone(),
                    source,
                })?;
        }

        Ok(())
    }

    async fn teardown_network(&self, sandbox: &Sandbox) -> Result<()> {
        let id = sandbox.id.as_str();
        let Some(netns) = sandbox.netns_path.as_deref() else {
            debug!("Sandbox {} has no network namespace", id);
            return Ok(());
        };

        let exists = self
            .filesystem
            .path_exists(netns)
            .await
            .map_err(|source| StopError::NetnsStat {
                id: id.to_string(),
                path: netns.to_path_buf(),
                source,
            })?;

        if !exists {
            // Already torn down by an earlier attempt
            debug!(
                "Network namespace {} of sandbox {} is gone",
                netns.display(),
                id
            );
        } else if !sandbox.uses_host_network() {
            let metadata = &sandbox.config.metadata;
            self.network
                .tear_down_pod(netns, &metadata.namespace, &metadata.name, id)
                .await
                .map_err(|source| StopError::Network {
                    id: id.to_string(),
                    source,
                })?;
        }

        info!("TearDown network for sandbox {:?} successfully", id);
        Ok(())
    }
}
