//! Kubelet device plugin endpoint serving one resource name.

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

mod health;
mod server;
mod service;

use std::path::Path;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

pub use health::DeviceHealth;
pub use server::DeviceServer;
pub use service::resource_env_var;

/// Device plugin API version sent on registration.
pub const VERSION: &str = "v1beta1";
/// Name of the kubelet registration socket inside the device plugin directory.
pub const KUBELET_SOCKET: &str = "kubelet.sock";
pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";
/// VFIO container device every passthrough container needs.
pub const VFIO_CONTAINER_DEVICE: &str = "/dev/vfio/vfio";
/// Directory holding one device file per IOMMU group.
pub const VFIO_DEVICE_DIR: &str = "/dev/vfio";
/// Prefix of the environment variable listing allocated PCI addresses.
pub const PCI_RESOURCE_PREFIX: &str = "PCI_RESOURCE";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a stopping server waits for ListAndWatch to send the empty device list.
const DEREGISTRATION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DeviceServerError {
    #[error("Failed to remove device plugin socket")]
    Cleanup,
    #[error("Failed to listen on device plugin socket")]
    Bind,
    #[error("Device plugin gRPC server failed")]
    Serve,
    #[error("Failed to register with the kubelet")]
    Registration,
    #[error("Device health check failed")]
    HealthCheck,
}

/// Open a gRPC channel over the unix socket at `path`.
pub async fn connect_unix_socket(path: &Path) -> Result<Channel, tonic::transport::Error> {
    let path = path.to_path_buf();

    // The URL is a placeholder, the connector always dials the socket
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }))
        .await
}
