use std::path::PathBuf;

use clap::Parser;

use crate::discovery::DiscoveryPolicy;

/// Expose configured VFIO-bound PCI devices to the kubelet as device plugin resources
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    #[arg(
        long,
        env = "VFIO_CONFIG_PATH",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/vfio/config.yaml",
        help = "Path of the resource configuration file"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/var/lib/kubelet/device-plugins",
        help = "Directory holding the kubelet and device plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket, defaults to <device-plugin-dir>/kubelet.sock"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/sys/bus/pci/devices",
        help = "sysfs directory listing PCI devices"
    )]
    pub pci_base_path: PathBuf,

    #[arg(
        long,
        env = "HOST_ROOT",
        value_hint = clap::ValueHint::DirPath,
        default_value = "/proc/1/root",
        help = "Host root used to look up device files for health checks"
    )]
    pub device_root: PathBuf,

    #[arg(
        long,
        default_value = "rwm",
        help = "Cgroup permissions granted on allocated device files"
    )]
    pub device_permissions: String,

    #[arg(
        long,
        env = "DISCOVERY_POLICY",
        value_enum,
        default_value_t = DiscoveryPolicy::Strict,
        help = "Whether a device failing discovery blocks startup (strict) or is skipped (best-effort)"
    )]
    pub discovery_policy: DiscoveryPolicy,

    #[arg(
        long,
        default_value = "30",
        help = "Seconds to wait before retrying a failed discovery"
    )]
    pub discovery_retry_interval: u64,

    #[arg(
        long,
        env = "LOG_DIR",
        value_hint = clap::ValueHint::DirPath,
        help = "Also write daily rotated logs into this directory"
    )]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn kubelet_socket(&self) -> PathBuf {
        self.kubelet_socket
            .clone()
            .unwrap_or_else(|| self.device_plugin_dir.join(crate::device_plugin::KUBELET_SOCKET))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_point_at_kubelet_paths() {
        let cli = Cli::parse_from(["vfio-device-plugin"]);

        assert_eq!(cli.config, PathBuf::from("/etc/vfio/config.yaml"));
        assert_eq!(
            cli.kubelet_socket(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
        assert_eq!(cli.discovery_policy, DiscoveryPolicy::Strict);
        assert_eq!(cli.discovery_retry_interval, 30);
    }

    #[test]
    fn parses_best_effort_policy() {
        let cli = Cli::parse_from([
            "vfio-device-plugin",
            "--discovery-policy",
            "best-effort",
            "--kubelet-socket",
            "/tmp/kubelet.sock",
        ]);

        assert_eq!(cli.discovery_policy, DiscoveryPolicy::BestEffort);
        assert_eq!(cli.kubelet_socket(), PathBuf::from("/tmp/kubelet.sock"));
    }
}
