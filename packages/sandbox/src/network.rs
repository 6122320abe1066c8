// ABOUTME: Network plugin collaborator that tears down a pod's network namespace
// ABOUTME: CNI implementation runs each plugin of a .conf/.conflist with CNI_COMMAND=DEL

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid CNI configuration: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CNI plugin {plugin:?} not found in {dirs:?}")]
    PluginNotFound { plugin: String, dirs: Vec<PathBuf> },
    #[error("CNI plugin {plugin} failed with code {code}: {msg}")]
    Plugin {
        plugin: String,
        code: u32,
        msg: String,
    },
    #[error("CNI plugin {plugin} exited with {status}: {output}")]
    PluginFailed {
        plugin: String,
        status: String,
        output: String,
    },
}

type Result<T> = std::result::Result<T, NetworkError>;

#[async_trait]
pub trait NetworkPlugin: Send + Sync {
    /// Remove the pod's network. Tearing down an already removed network
    /// succeeds.
    async fn tear_down_pod(
        &self,
        netns_path: &Path,
        namespace: &str,
        name: &str,
        sandbox_id: &str,
    ) -> Result<()>;
}

/// Error object a CNI plugin prints on stdout when it fails
#[derive(Debug, Deserialize)]
struct CniErrorResult {
    code: u32,
    msg: String,
    #[serde(default)]
    details: String,
}

/// Network defined by a CNI configuration file
#[derive(Debug, Clone)]
struct CniNetwork {
    name: String,
    cni_version: String,
    plugins: Vec<Value>,
}

impl CniNetwork {
    fn parse(json: &str) -> Result<Self> {
        let conf: Value =
            serde_json::from_str(json).map_err(|e| NetworkError::Config(e.to_string()))?;

        let name = conf
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| NetworkError::Config("missing network name".to_string()))?
            .to_string();
        let cni_version = conf
            .get("cniVersion")
            .and_then(Value::as_str)
            .unwrap_or("0.4.0")
            .to_string();

        // A .conflist carries a plugin chain; a .conf is a single plugin
        let plugins = match conf.get("plugins") {
            Some(Value::Array(plugins)) => plugins.clone(),
            Some(_) => return Err(NetworkError::Config("plugins must be an array".to_string())),
            None => vec![conf.clone()],
        };

        if plugins.is_empty() {
            return Err(NetworkError::Config(format!(
                "network {} has no plugins",
                name
            )));
        }
        for plugin in &plugins {
            if plugin.get("type").and_then(Value::as_str).is_none() {
                return Err(NetworkError::Config(format!(
                    "plugin in network {} has no type",
                    name
                )));
            }
        }

        Ok(Self {
            name,
            cni_version,
            plugins,
        })
    }

    /// Stdin payload for one plugin: its own config plus the network identity
    fn plugin_config(&self, plugin: &Value) -> Value {
        let mut config = plugin.clone();
        if let Value::Object(map) = &mut config {
            map.insert("name".to_string(), Value::String(self.name.clone()));
            map.insert(
                "cniVersion".to_string(),
                Value::String(self.cni_version.clone()),
            );
            map.remove("plugins");
        }
        config
    }
}

/// Network plugin driving CNI binaries directly
#[derive(Debug, Clone)]
pub struct CniPlugin {
    bin_dirs: Vec<PathBuf>,
    ifname: String,
    network: CniNetwork,
}

impl CniPlugin {
    /// Load a CNI `.conf` or `.conflist` file
    pub fn load(conf_file: &Path, bin_dirs: Vec<PathBuf>, ifname: &str) -> Result<Self> {
        let json = std::fs::read_to_string(conf_file)?;
        Self::from_json(&json, bin_dirs, ifname)
    }

    pub fn from_json(json: &str, bin_dirs: Vec<PathBuf>, ifname: &str) -> Result<Self> {
        let network = CniNetwork::parse(json)?;
        info!(
            "Loaded CNI network {} with {} plugins",
            network.name,
            network.plugins.len()
        );
        Ok(Self {
            bin_dirs,
            ifname: ifname.to_string(),
            network,
        })
    }

    fn find_plugin(&self, plugin_type: &str) -> Result<PathBuf> {
        self.bin_dirs
            .iter()
            .map(|dir| dir.join(plugin_type))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| NetworkError::PluginNotFound {
                plugin: plugin_type.to_string(),
                dirs: self.bin_dirs.clone(),
            })
    }

    fn cni_path(&self) -> String {
        self.bin_dirs
            .iter()
            .map(|dir| dir.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    async fn delete(
        &self,
        plugin: &Value,
        netns_path: &Path,
        cni_args: &str,
        sandbox_id: &str,
    ) -> Result<()> {
        let plugin_type = plugin.get("type").and_then(Value::as_str).unwrap_or_default();
        let binary = self.find_plugin(plugin_type)?;
        let stdin_config = serde_json::to_vec(&self.network.plugin_config(plugin))
            .map_err(|e| NetworkError::Config(e.to_string()))?;

        debug!(
            "Running CNI DEL for sandbox {} with plugin {}",
            sandbox_id,
            binary.display()
        );

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", "DEL")
            .env("CNI_CONTAINERID", sandbox_id)
            .env("CNI_NETNS", netns_path)
            .env("CNI_IFNAME", &self.ifname)
            .env("CNI_ARGS", cni_args)
            .env("CNI_PATH", self.cni_path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A plugin may exit without reading its config
            if let Err(e) = stdin.write_all(&stdin_config).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Ok(result) = serde_json::from_str::<CniErrorResult>(&stdout) {
            let msg = if result.details.is_empty() {
                result.msg
            } else {
                format!("{}; {}", result.msg, result.details)
            };
            return Err(NetworkError::Plugin {
                plugin: plugin_type.to_string(),
                code: result.code,
                msg,
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(NetworkError::PluginFailed {
            plugin: plugin_type.to_string(),
            status: output.status.to_string(),
            output: format!("{} {}", stdout.trim(), stderr.trim())
                .trim()
                .to_string(),
        })
    }
}

#[async_trait]
impl NetworkPlugin for CniPlugin {
    async fn tear_down_pod(
        &self,
        netns_path: &Path,
        namespace: &str,
        name: &str,
        sandbox_id: &str,
    ) -> Result<()> {
        let cni_args = format!(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={}",
            namespace, name, sandbox_id
        );

        // DEL runs the chain in reverse of ADD
        for plugin in self.network.plugins.iter().rev() {
            self.delete(plugin, netns_path, &cni_args, sandbox_id)
                .await?;
        }

        info!(
            "Removed pod {}/{} from CNI network {}",
            namespace, name, self.network.name
        );
        Ok(())
    }
}
