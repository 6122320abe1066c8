// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across podshim

// State Layout
pub const PODSHIM_ROOT_DIR: &str = "PODSHIM_ROOT_DIR";

// Termination
pub const PODSHIM_TASK_WAIT_TIMEOUT_SECS: &str = "PODSHIM_TASK_WAIT_TIMEOUT_SECS";

// CNI Network Plugin
pub const PODSHIM_CNI_BIN_DIRS: &str = "PODSHIM_CNI_BIN_DIRS";
pub const PODSHIM_CNI_CONF_FILE: &str = "PODSHIM_CNI_CONF_FILE";
pub const PODSHIM_CNI_IFNAME: &str = "PODSHIM_CNI_IFNAME";

// Defaults
pub const DEFAULT_ROOT_DIR: &str = "/var/lib/podshim";
pub const DEFAULT_CNI_BIN_DIRS: &str = "/opt/cni/bin";
pub const DEFAULT_CNI_CONF_FILE: &str = "/etc/cni/net.d/10-podshim.conflist";
pub const DEFAULT_CNI_IFNAME: &str = "eth0";

// Docker Engine
pub const DOCKER_HOST: &str = "DOCKER_HOST"; // Read by bollard's connect_with_defaults
