use std::collections::BTreeSet;
use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;

use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::ContainerAllocateResponse;
use super::api::DevicePluginOptions;
use super::api::DeviceSpec;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::DeviceHealth;
use super::HEALTHY;
use super::PCI_RESOURCE_PREFIX;
use super::UNHEALTHY;
use super::VFIO_CONTAINER_DEVICE;
use super::VFIO_DEVICE_DIR;
use crate::discovery::DiscoveredDevice;

/// Environment variable name for `resource_name`, e.g.
/// `PCI_RESOURCE_NVIDIA_COM_PCI-8086` for `nvidia.com/pci-8086`.
pub fn resource_env_var(prefix: &str, resource_name: &str) -> String {
    let name = resource_name.to_uppercase().replace(['/', '.'], "_");
    format!("{prefix}_{name}")
}

/// Host path of the VFIO group device backing `device`.
pub(crate) fn vfio_group_path(device: &DiscoveredDevice) -> String {
    format!("{VFIO_DEVICE_DIR}/{}", device.iommu_group)
}

fn plugin_device(device: &DiscoveredDevice) -> api::Device {
    let topology = (device.numa_node >= 0).then(|| api::TopologyInfo {
        nodes: vec![api::NumaNode {
            id: device.numa_node,
        }],
    });
    api::Device {
        id: device.address.clone(),
        health: HEALTHY.to_string(),
        topology,
    }
}

/// Sole consumer of the health queue. Publishes the rendered device list after
/// every record so each ListAndWatch stream can keep its own copy.
pub(crate) struct HealthTracker {
    devices: watch::Sender<Vec<api::Device>>,
    health: mpsc::UnboundedReceiver<DeviceHealth>,
}

impl HealthTracker {
    pub(crate) fn new(
        devices: &[DiscoveredDevice],
        health: mpsc::UnboundedReceiver<DeviceHealth>,
    ) -> Self {
        let (devices, _) = watch::channel(devices.iter().map(plugin_device).collect());
        Self { devices, health }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Vec<api::Device>> {
        self.devices.subscribe()
    }

    /// Apply every record that is already queued, e.g. devices found missing
    /// while the monitor set up its watches.
    pub(crate) fn apply_pending(&mut self) {
        while let Ok(update) = self.health.try_recv() {
            self.apply(&update);
        }
    }

    fn apply(&self, update: &DeviceHealth) {
        let health = if update.healthy { HEALTHY } else { UNHEALTHY };
        self.devices.send_modify(|devices| {
            for device in devices.iter_mut().filter(|d| d.id == update.id) {
                device.health = health.to_string();
            }
        });
    }

    /// Apply health records in queue order until `done` fires.
    pub(crate) async fn run(mut self, done: CancellationToken) {
        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                update = self.health.recv() => match update {
                    Some(update) => self.apply(&update),
                    // monitor is gone, keep the last list until the session ends
                    None => {
                        done.cancelled().await;
                        return;
                    }
                },
            }
        }
    }
}

/// Lets the server wait until ListAndWatch has told the kubelet the devices are gone.
#[derive(Clone)]
pub(crate) struct Deregistration {
    streams: TaskTracker,
}

impl Deregistration {
    /// Resolves once every open stream sent its final empty list or lost its
    /// client, right away if no stream is open.
    pub(crate) async fn wait(&self) {
        self.streams.close();
        self.streams.wait().await;
    }
}

/// gRPC side of one device server session.
pub(crate) struct DevicePluginService {
    resource_name: String,
    devices: Vec<DiscoveredDevice>,
    permissions: String,
    device_states: watch::Receiver<Vec<api::Device>>,
    /// Fires when the session ends, either on stop or on server teardown.
    done: CancellationToken,
    streams: TaskTracker,
}

impl DevicePluginService {
    pub(crate) fn new(
        resource_name: String,
        devices: Vec<DiscoveredDevice>,
        permissions: String,
        device_states: watch::Receiver<Vec<api::Device>>,
        done: CancellationToken,
    ) -> Self {
        Self {
            resource_name,
            devices,
            permissions,
            device_states,
            done,
            streams: TaskTracker::new(),
        }
    }

    pub(crate) fn deregistration(&self) -> Deregistration {
        Deregistration {
            streams: self.streams.clone(),
        }
    }

    fn device_spec(&self, path: &str) -> DeviceSpec {
        DeviceSpec {
            container_path: path.to_string(),
            host_path: path.to_string(),
            permissions: self.permissions.clone(),
        }
    }

    fn container_response(&self, device_ids: &[String]) -> ContainerAllocateResponse {
        let mut groups = BTreeSet::new();
        let mut addresses = Vec::with_capacity(device_ids.len());
        for id in device_ids {
            match self.devices.iter().find(|d| &d.address == id) {
                Some(device) => {
                    groups.insert(vfio_group_path(device));
                    addresses.push(id.as_str());
                }
                None => tracing::warn!(
                    "Allocate: unknown device {id} requested for {}",
                    self.resource_name
                ),
            }
        }

        let mut devices = vec![self.device_spec(VFIO_CONTAINER_DEVICE)];
        devices.extend(groups.iter().map(|path| self.device_spec(path)));

        let mut envs = HashMap::new();
        if !addresses.is_empty() {
            envs.insert(
                resource_env_var(PCI_RESOURCE_PREFIX, &self.resource_name),
                addresses.join(","),
            );
        }

        ContainerAllocateResponse {
            envs,
            mounts: Vec::new(),
            devices,
            annotations: HashMap::new(),
            cdi_devices: Vec::new(),
        }
    }
}

type ListAndWatchItem = Result<ListAndWatchResponse, Status>;

/// Stream one ListAndWatch session: the full device list first, then the
/// full list again on every health update, and an empty list at the end.
///
/// A stream whose client went away ends without the empty list.
async fn watch_devices(
    resource_name: String,
    mut device_states: watch::Receiver<Vec<api::Device>>,
    done: CancellationToken,
    tx: mpsc::Sender<ListAndWatchItem>,
) {
    let devices = device_states.borrow_and_update().clone();
    if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
        tracing::info!("{resource_name} ListAndWatch client went away");
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = done.cancelled() => break,
            _ = tx.closed() => {
                tracing::info!("{resource_name} ListAndWatch client went away");
                return;
            }
            changed = device_states.changed() => {
                if changed.is_err() {
                    break;
                }
                let devices = device_states.borrow_and_update().clone();
                if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                    tracing::info!("{resource_name} ListAndWatch client went away");
                    return;
                }
            }
        }
    }

    let empty = ListAndWatchResponse {
        devices: Vec::new(),
    };
    if tx.send(Ok(empty)).await.is_err() {
        tracing::info!("{resource_name} device plugin failed to deregister");
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }))
    }

    type ListAndWatchStream = Pin<Box<dyn Stream<Item = ListAndWatchItem> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        tracing::info!("ListAndWatch opened for {}", self.resource_name);
        let (tx, rx) = mpsc::channel(16);
        self.streams.spawn(watch_devices(
            self.resource_name.clone(),
            self.device_states.clone(),
            self.done.clone(),
            tx,
        ));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        tracing::debug!(
            "preferred allocation is not supported: {:?}",
            request.into_inner()
        );
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: Vec::new(),
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        tracing::info!("Allocate: resourceName: {}", self.resource_name);
        tracing::info!("Allocate: request: {:?}", request.container_requests);

        let container_responses = request
            .container_requests
            .iter()
            .map(|container| self.container_response(&container.devices_ids))
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
