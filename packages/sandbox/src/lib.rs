// ABOUTME: Pod sandbox termination for podshim
// ABOUTME: Wires the registry, execution engine, network plugin and filesystem into the stop orchestrator

pub mod config;
pub mod manager;
pub mod mounts;
pub mod network;
pub mod reaper;
pub mod store;

pub use config::{ConfigError, ShimConfig};
pub use manager::{SandboxManager, SetupError, StopError, StopStep};
pub use mounts::{sandbox_root_dir, sandbox_shm_path, Filesystem, HostFilesystem, MountError};
pub use network::{CniPlugin, NetworkError, NetworkPlugin};
pub use reaper::{ReapError, TaskReaper};
pub use store::{
    Container, ContainerState, MemoryStore, NamespaceOptions, PodMetadata, Registry,
    RegistryError, Sandbox, SandboxConfig, SandboxState,
};
