use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;

use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::api::DevicePluginOptions;
use super::api::RegisterRequest;
use super::connect_unix_socket;
use super::health::HealthMonitor;
use super::health::MonitorExit;
use super::service::vfio_group_path;
use super::service::DevicePluginService;
use super::service::HealthTracker;
use super::DeviceServerError;
use super::CONNECTION_TIMEOUT;
use super::DEREGISTRATION_GRACE;
use super::VERSION;
use crate::config::ServerConfig;
use crate::controller::ManagedDevice;
use crate::discovery::DiscoveredDevice;
use crate::discovery::ResourceGroup;

/// Socket file name for `resource_name`, e.g. `vfio-nvidia.com_pci-8086.sock`.
pub fn socket_name(resource_name: &str) -> String {
    format!("vfio-{}.sock", resource_name.replace('/', "_"))
}

/// Device plugin endpoint for one resource name.
///
/// Every call to [`DeviceServer::start`] binds a fresh socket, registers with
/// the kubelet and serves until stopped or until the kubelet drops the
/// registration, then deregisters and removes the socket again.
#[derive(Debug)]
pub struct DeviceServer {
    resource_name: String,
    devices: Vec<DiscoveredDevice>,
    socket_path: PathBuf,
    config: ServerConfig,
    initialized: AtomicBool,
}

impl DeviceServer {
    pub fn new(group: ResourceGroup, config: ServerConfig) -> Self {
        let socket_path = config
            .device_plugin_dir
            .join(socket_name(&group.resource_name));
        Self {
            resource_name: group.resource_name,
            devices: group.devices,
            socket_path,
            config,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the server is registered and serving.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> String {
        socket_name(&self.resource_name)
    }

    /// Device files as seen through the device root, mapped to the devices they back.
    fn health_paths(&self) -> HashMap<PathBuf, Vec<String>> {
        let mut paths: HashMap<PathBuf, Vec<String>> = HashMap::new();
        for device in &self.devices {
            let host_path = vfio_group_path(device);
            let path = self
                .config
                .device_root
                .join(host_path.trim_start_matches('/'));
            paths.entry(path).or_default().push(device.address.clone());
        }
        paths
    }

    /// Serve the device plugin until `stop` is cancelled or the kubelet
    /// removes our socket.
    ///
    /// # Errors
    ///
    /// - [`DeviceServerError::Bind`] if the socket can't be created
    /// - [`DeviceServerError::Registration`] if the kubelet rejects or can't
    ///   be reached for registration
    /// - [`DeviceServerError::Serve`] and [`DeviceServerError::HealthCheck`]
    ///   if the gRPC server or the health monitor fail
    /// - [`DeviceServerError::Cleanup`] if the socket can't be removed
    #[tracing::instrument(skip_all, fields(resource = %self.resource_name))]
    pub async fn start(&self, stop: CancellationToken) -> Result<(), Report<DeviceServerError>> {
        self.cleanup()?;
        let listener = UnixListener::bind(&self.socket_path)
            .change_context(DeviceServerError::Bind)
            .attach_printable_lazy(|| format!("socket: {}", self.socket_path.display()))?;

        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor::new(
            self.resource_name.clone(),
            self.health_paths(),
            self.socket_path.clone(),
        );
        let monitor = match monitor.watch(health_tx) {
            Ok(monitor) => monitor,
            Err(e) => {
                if let Err(cleanup) = self.cleanup() {
                    tracing::error!("{} socket cleanup failed: {cleanup:?}", self.resource_name);
                }
                return Err(e);
            }
        };

        // Devices missing right now are reported as such from the first list on
        let mut tracker = HealthTracker::new(&self.devices, health_rx);
        tracker.apply_pending();

        // `done` ends this session; as a child of `stop` it also fires on shutdown
        let done = stop.child_token();
        let service = DevicePluginService::new(
            self.resource_name.clone(),
            self.devices.clone(),
            self.config.permissions.clone(),
            tracker.subscribe(),
            done.clone(),
        );
        let deregistration = service.deregistration();

        let tracker_task = tokio::spawn(tracker.run(done.clone()));
        let shutdown = CancellationToken::new();
        let mut serve_task = tokio::spawn(serve(service, listener, shutdown.clone()));
        let mut monitor_task = tokio::spawn(monitor.run(done.clone()));

        let mut serve_finished = false;
        let mut monitor_finished = false;
        let result = async {
            tokio::select! {
                registered = self.register() => registered?,
                _ = done.cancelled() => return Ok(()),
            }
            self.initialized.store(true, Ordering::SeqCst);
            tracing::info!("{} device plugin started", self.resource_name);

            tokio::select! {
                served = &mut serve_task => {
                    serve_finished = true;
                    flatten_join(served, DeviceServerError::Serve)
                }
                monitored = &mut monitor_task => {
                    monitor_finished = true;
                    match flatten_join(monitored, DeviceServerError::HealthCheck)? {
                        MonitorExit::Stopped => tracing::info!("{} device plugin stopping", self.resource_name),
                        MonitorExit::SocketRemoved => tracing::info!(
                            "{} device plugin lost its registration",
                            self.resource_name
                        ),
                    }
                    Ok(())
                }
            }
        }
        .await;

        // Stop the streams and the monitor, then give ListAndWatch a moment
        // to send the empty device list before the server goes away
        done.cancel();
        if tokio::time::timeout(DEREGISTRATION_GRACE, deregistration.wait())
            .await
            .is_err()
        {
            tracing::warn!("{} device plugin did not deregister in time", self.resource_name);
        }

        shutdown.cancel();
        if !serve_finished {
            match tokio::time::timeout(DEREGISTRATION_GRACE, &mut serve_task).await {
                Ok(served) => {
                    if let Err(e) = flatten_join(served, DeviceServerError::Serve) {
                        tracing::warn!("{} gRPC server stopped with error: {e:?}", self.resource_name);
                    }
                }
                Err(_) => {
                    tracing::warn!("{} gRPC server did not stop in time", self.resource_name);
                    serve_task.abort();
                }
            }
        }
        if !monitor_finished {
            if let Ok(Err(e)) = monitor_task.await {
                tracing::warn!("{} health monitor failed during shutdown: {e:?}", self.resource_name);
            }
        }
        if let Err(e) = tracker_task.await {
            tracing::warn!("{} health tracker failed: {e}", self.resource_name);
        }

        self.initialized.store(false, Ordering::SeqCst);
        let cleaned = self.cleanup();
        match (result, cleaned) {
            (Err(e), Err(cleanup)) => {
                tracing::error!("{} socket cleanup failed: {cleanup:?}", self.resource_name);
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn register(&self) -> Result<(), Report<DeviceServerError>> {
        let kubelet_socket = &self.config.kubelet_socket;
        let channel = tokio::time::timeout(CONNECTION_TIMEOUT, connect_unix_socket(kubelet_socket))
            .await
            .map_err(|_| {
                Report::new(DeviceServerError::Registration)
                    .attach_printable(format!("timed out connecting to {}", kubelet_socket.display()))
            })?
            .change_context(DeviceServerError::Registration)
            .attach_printable_lazy(|| format!("kubelet socket: {}", kubelet_socket.display()))?;

        let request = RegisterRequest {
            version: VERSION.to_string(),
            endpoint: self.endpoint(),
            resource_name: self.resource_name.clone(),
            options: Some(DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            }),
        };
        RegistrationClient::new(channel)
            .register(Request::new(request))
            .await
            .change_context(DeviceServerError::Registration)?;

        tracing::info!(
            "registered {} with kubelet as {}",
            self.resource_name,
            self.endpoint()
        );
        Ok(())
    }

    /// Remove the socket file; a socket that is already gone is fine.
    fn cleanup(&self) -> Result<(), Report<DeviceServerError>> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Report::new(e)
                .change_context(DeviceServerError::Cleanup)
                .attach_printable(format!("socket: {}", self.socket_path.display()))),
        }
    }
}

#[async_trait]
impl ManagedDevice for DeviceServer {
    fn name(&self) -> &str {
        &self.resource_name
    }

    async fn start(&self, stop: CancellationToken) -> Result<(), Report<DeviceServerError>> {
        DeviceServer::start(self, stop).await
    }
}

async fn serve(
    service: DevicePluginService,
    listener: UnixListener,
    shutdown: CancellationToken,
) -> Result<(), Report<DeviceServerError>> {
    tonic::transport::Server::builder()
        .add_service(DevicePluginServer::new(service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            shutdown.cancelled().await;
        })
        .await
        .change_context(DeviceServerError::Serve)
}

/// Fold a task's panic or cancellation into its own error.
fn flatten_join<T>(
    joined: Result<Result<T, Report<DeviceServerError>>, JoinError>,
    context: DeviceServerError,
) -> Result<T, Report<DeviceServerError>> {
    joined.change_context(context)?
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn socket_name_flattens_the_resource_domain() {
        assert_eq!(socket_name("intel.com/qat"), "vfio-intel.com_qat.sock");
        assert_eq!(socket_name("gpu"), "vfio-gpu.sock");
    }

    #[test]
    fn health_paths_share_a_group_device() {
        let device = |address: &str| DiscoveredDevice {
            address: address.to_string(),
            vendor_device_id: "10de:1eb8".to_string(),
            driver: "vfio-pci".to_string(),
            iommu_group: "40".to_string(),
            numa_node: -1,
        };
        let server = DeviceServer::new(
            ResourceGroup {
                resource_name: "nvidia.com/t4".to_string(),
                devices: vec![device("0000:86:00.0"), device("0000:86:00.1")],
            },
            ServerConfig {
                device_plugin_dir: "/var/lib/kubelet/device-plugins".into(),
                kubelet_socket: "/var/lib/kubelet/device-plugins/kubelet.sock".into(),
                device_root: "/proc/1/root".into(),
                permissions: "rwm".to_string(),
            },
        );

        assert_eq!(
            server.socket_path(),
            Path::new("/var/lib/kubelet/device-plugins/vfio-nvidia.com_t4.sock")
        );
        assert_eq!(
            server.health_paths(),
            HashMap::from([(
                PathBuf::from("/proc/1/root/dev/vfio/40"),
                vec!["0000:86:00.0".to_string(), "0000:86:00.1".to_string()]
            )])
        );
    }
}
