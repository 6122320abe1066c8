// ABOUTME: Shim configuration loaded from environment variables
// ABOUTME: State root, per-task wait budget and CNI plugin locations

use podshim_config::constants::{
    DEFAULT_CNI_BIN_DIRS, DEFAULT_CNI_CONF_FILE, DEFAULT_CNI_IFNAME, DEFAULT_ROOT_DIR,
    PODSHIM_CNI_BIN_DIRS, PODSHIM_CNI_CONF_FILE, PODSHIM_CNI_IFNAME, PODSHIM_ROOT_DIR,
    PODSHIM_TASK_WAIT_TIMEOUT_SECS,
};
use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid task wait timeout: {0}")]
    InvalidTimeout(#[from] ParseIntError),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShimConfig {
    pub root_dir: PathBuf,
    /// Budget for a single task's exit wait; `None` waits until the event
    /// stream delivers or fails
    pub task_wait_timeout: Option<Duration>,
    pub cni_bin_dirs: Vec<PathBuf>,
    pub cni_conf_file: PathBuf,
    pub cni_ifname: String,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            task_wait_timeout: None,
            cni_bin_dirs: split_dirs(DEFAULT_CNI_BIN_DIRS),
            cni_conf_file: PathBuf::from(DEFAULT_CNI_CONF_FILE),
            cni_ifname: DEFAULT_CNI_IFNAME.to_string(),
        }
    }
}

fn split_dirs(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

impl ShimConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let root_dir = env::var(PODSHIM_ROOT_DIR).unwrap_or_else(|_| DEFAULT_ROOT_DIR.to_string());
        if root_dir.trim().is_empty() {
            return Err(ConfigError::Empty(PODSHIM_ROOT_DIR));
        }

        // 0 or unset means no budget
        let task_wait_timeout = match env::var(PODSHIM_TASK_WAIT_TIMEOUT_SECS) {
            Ok(value) => match value.trim().parse::<u64>()? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            Err(_) => None,
        };

        let cni_bin_dirs = split_dirs(
            &env::var(PODSHIM_CNI_BIN_DIRS).unwrap_or_else(|_| DEFAULT_CNI_BIN_DIRS.to_string()),
        );
        if cni_bin_dirs.is_empty() {
            return Err(ConfigError::Empty(PODSHIM_CNI_BIN_DIRS));
        }

        let cni_conf_file = env::var(PODSHIM_CNI_CONF_FILE)
            .unwrap_or_else(|_| DEFAULT_CNI_CONF_FILE.to_string());

        let cni_ifname =
            env::var(PODSHIM_CNI_IFNAME).unwrap_or_else(|_| DEFAULT_CNI_IFNAME.to_string());

        Ok(ShimConfig {
            root_dir: PathBuf::from(root_dir),
            task_wait_timeout,
            cni_bin_dirs,
            cni_conf_file: PathBuf::from(cni_conf_file),
            cni_ifname,
        })
    }
}
