pub mod cli;
pub mod resources;

use std::path::PathBuf;
use std::time::Duration;

use crate::controller::Backoff;
use crate::discovery::DiscoveryPolicy;

/// Paths and permissions shared by every device server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory the per-resource sockets are created in.
    pub device_plugin_dir: PathBuf,
    /// Kubelet registration socket.
    pub kubelet_socket: PathBuf,
    /// Host root that device files are looked up under for health checks.
    pub device_root: PathBuf,
    /// Cgroup permissions granted on allocated device files.
    pub permissions: String,
}

impl From<&Cli> for ServerConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            device_plugin_dir: cli.device_plugin_dir.clone(),
            kubelet_socket: cli.kubelet_socket(),
            device_root: cli.device_root.clone(),
            permissions: cli.device_permissions.clone(),
        }
    }
}

/// Settings for the device controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub discovery_policy: DiscoveryPolicy,
    /// Wait between two discovery attempts.
    pub discovery_retry_interval: Duration,
    /// Restart delays for crashed device servers.
    pub backoff: Backoff,
    pub server: ServerConfig,
}

impl From<&Cli> for ControllerConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            discovery_policy: cli.discovery_policy,
            discovery_retry_interval: Duration::from_secs(cli.discovery_retry_interval),
            backoff: Backoff::default(),
            server: ServerConfig::from(cli),
        }
    }
}

pub use cli::*;
pub use resources::*;
