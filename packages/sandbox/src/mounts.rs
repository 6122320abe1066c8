// ABOUTME: Filesystem collaborator for sandbox teardown: path existence checks and unmounting
// ABOUTME: Host implementation detaches the sandbox /dev/shm mount with umount2(MNT_DETACH)

use crate::store::SandboxConfig;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("Failed to unmount {path}: {source}")]
    Unmount { path: PathBuf, source: Errno },
    #[error("Unmount task failed: {0}")]
    Task(String),
}

/// Root directory holding a sandbox's state
pub fn sandbox_root_dir(root_dir: &Path, sandbox_id: &str) -> PathBuf {
    root_dir.join("sandboxes").join(sandbox_id)
}

/// Mount point of the sandbox's private /dev/shm
pub fn sandbox_shm_path(sandbox_root: &Path) -> PathBuf {
    sandbox_root.join("shm")
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    /// `Ok(false)` when the path does not exist; any other failure is an error
    async fn path_exists(&self, path: &Path) -> io::Result<bool>;

    /// Unmount every mount the sandbox owns under `sandbox_root`
    async fn unmount_all(
        &self,
        sandbox_root: &Path,
        config: &SandboxConfig,
    ) -> Result<(), MountError>;
}

/// Filesystem backed by the host kernel
#[derive(Debug, Clone, Default)]
pub struct HostFilesystem;

impl HostFilesystem {
    pub fn new() -> Self {
        Self
    }
}

/// Lazily unmount `path`. A missing path or one that is not a mount point
/// counts as already unmounted.
fn detach(path: &Path) -> Result<(), MountError> {
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => {
            debug!("Unmounted {}", path.display());
            Ok(())
        }
        Err(Errno::ENOENT) | Err(Errno::EINVAL) => {
            debug!("{} is not mounted", path.display());
            Ok(())
        }
        Err(source) => Err(MountError::Unmount {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[async_trait]
impl Filesystem for HostFilesystem {
    async fn path_exists(&self, path: &Path) -> io::Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn unmount_all(
        &self,
        sandbox_root: &Path,
        config: &SandboxConfig,
    ) -> Result<(), MountError> {
        // Pods on the host IPC namespace use the host's /dev/shm
        if config.namespace_options.host_ipc {
            return Ok(());
        }

        let shm = sandbox_shm_path(sandbox_root);
        tokio::task::spawn_blocking(move || detach(&shm))
            .await
            .map_err(|e| MountError::Task(e.to_string()))?
    }
}
