use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use similar_asserts::assert_eq;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;

use vfio_device_plugin::config::ServerConfig;
use vfio_device_plugin::controller::Backoff;
use vfio_device_plugin::controller::SupervisedRunner;
use vfio_device_plugin::device_plugin::api;
use vfio_device_plugin::device_plugin::api::device_plugin_client::DevicePluginClient;
use vfio_device_plugin::device_plugin::api::registration_server::Registration;
use vfio_device_plugin::device_plugin::api::registration_server::RegistrationServer;
use vfio_device_plugin::device_plugin::connect_unix_socket;
use vfio_device_plugin::device_plugin::DeviceServer;
use vfio_device_plugin::device_plugin::HEALTHY;
use vfio_device_plugin::device_plugin::UNHEALTHY;
use vfio_device_plugin::device_plugin::VERSION;
use vfio_device_plugin::discovery::DiscoveredDevice;
use vfio_device_plugin::discovery::ResourceGroup;
use vfio_device_plugin::discovery::VFIO_DRIVER;

const RESOURCE: &str = "example.com/nic";
const ADDRESS: &str = "0000:3b:00.0";
const WAIT: Duration = Duration::from_secs(5);

/// Kubelet registration endpoint that records every request.
struct FakeKubelet {
    registrations: mpsc::UnboundedSender<api::RegisterRequest>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<api::RegisterRequest>,
    ) -> Result<Response<api::Empty>, Status> {
        self.registrations
            .send(request.into_inner())
            .map_err(|_| Status::unavailable("test finished"))?;
        Ok(Response::new(api::Empty {}))
    }
}

struct Host {
    root: tempfile::TempDir,
    registrations: mpsc::UnboundedReceiver<api::RegisterRequest>,
    kubelet_stop: CancellationToken,
}

impl Host {
    /// Plugin directory with a running kubelet and one VFIO group device file.
    fn start() -> Self {
        let root = tempfile::tempdir().expect("should create temp dir");
        std::fs::create_dir_all(root.path().join("device-plugins"))
            .expect("should create plugin dir");
        std::fs::create_dir_all(root.path().join("dev/vfio")).expect("should create vfio dir");
        std::fs::write(root.path().join("dev/vfio/12"), b"").expect("should create group device");

        let listener = UnixListener::bind(root.path().join("device-plugins/kubelet.sock"))
            .expect("should bind kubelet socket");
        let (tx, registrations) = mpsc::unbounded_channel();
        let kubelet_stop = CancellationToken::new();
        tokio::spawn({
            let kubelet_stop = kubelet_stop.clone();
            async move {
                tonic::transport::Server::builder()
                    .add_service(RegistrationServer::new(FakeKubelet { registrations: tx }))
                    .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                        kubelet_stop.cancelled().await;
                    })
                    .await
            }
        });

        Self {
            root,
            registrations,
            kubelet_stop,
        }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn group_device(&self) -> PathBuf {
        self.path().join("dev/vfio/12")
    }

    fn server(&self) -> DeviceServer {
        let group = ResourceGroup {
            resource_name: RESOURCE.to_string(),
            devices: vec![DiscoveredDevice {
                address: ADDRESS.to_string(),
                vendor_device_id: "8086:10fb".to_string(),
                driver: VFIO_DRIVER.to_string(),
                iommu_group: "12".to_string(),
                numa_node: 0,
            }],
        };
        DeviceServer::new(
            group,
            ServerConfig {
                device_plugin_dir: self.path().join("device-plugins"),
                kubelet_socket: self.path().join("device-plugins/kubelet.sock"),
                device_root: self.path().to_path_buf(),
                permissions: "rw".to_string(),
            },
        )
    }

    async fn next_registration(&mut self) -> api::RegisterRequest {
        tokio::time::timeout(WAIT, self.registrations.recv())
            .await
            .expect("device server should register")
            .expect("kubelet should be running")
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.kubelet_stop.cancel();
    }
}

async fn wait_until_initialized(server: &DeviceServer) {
    tokio::time::timeout(WAIT, async {
        while !server.is_initialized() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device server should finish starting");
}

async fn next_devices(stream: &mut tonic::Streaming<api::ListAndWatchResponse>) -> Vec<api::Device> {
    tokio::time::timeout(WAIT, stream.message())
        .await
        .expect("should receive a device list")
        .expect("stream should not fail")
        .expect("stream should stay open")
        .devices
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_registers_and_reports_health() {
    let mut host = Host::start();
    let server = Arc::new(host.server());
    let stop = CancellationToken::new();
    let serving = tokio::spawn({
        let server = server.clone();
        let stop = stop.clone();
        async move { server.start(stop).await }
    });

    let registration = host.next_registration().await;
    assert_eq!(registration.version, VERSION);
    assert_eq!(registration.resource_name, RESOURCE);
    assert_eq!(registration.endpoint, "vfio-example.com_nic.sock");
    wait_until_initialized(&server).await;
    assert!(server.socket_path().exists());

    let channel = connect_unix_socket(server.socket_path())
        .await
        .expect("should connect to the device plugin");
    let mut client = DevicePluginClient::new(channel);

    let options = client
        .get_device_plugin_options(api::Empty {})
        .await
        .expect("options should be served")
        .into_inner();
    assert!(!options.pre_start_required);

    let mut stream = client
        .list_and_watch(api::Empty {})
        .await
        .expect("ListAndWatch should be served")
        .into_inner();
    let devices = next_devices(&mut stream).await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, ADDRESS);
    assert_eq!(devices[0].health, HEALTHY);
    assert_eq!(
        devices[0].topology,
        Some(api::TopologyInfo {
            nodes: vec![api::NumaNode { id: 0 }]
        })
    );

    let allocation = client
        .allocate(api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: vec![ADDRESS.to_string()],
            }],
        })
        .await
        .expect("allocation should succeed")
        .into_inner();
    let container = &allocation.container_responses[0];
    let host_paths: Vec<&str> = container
        .devices
        .iter()
        .map(|device| device.host_path.as_str())
        .collect();
    assert_eq!(host_paths, vec!["/dev/vfio/vfio", "/dev/vfio/12"]);
    assert_eq!(
        container.envs.get("PCI_RESOURCE_EXAMPLE_COM_NIC").map(String::as_str),
        Some(ADDRESS)
    );

    std::fs::remove_file(host.group_device()).expect("should remove group device");
    let devices = next_devices(&mut stream).await;
    assert_eq!(devices[0].health, UNHEALTHY);

    std::fs::write(host.group_device(), b"").expect("should recreate group device");
    let devices = next_devices(&mut stream).await;
    assert_eq!(devices[0].health, HEALTHY);

    stop.cancel();
    assert!(next_devices(&mut stream).await.is_empty());

    tokio::time::timeout(WAIT, serving)
        .await
        .expect("device server should stop")
        .expect("device server should not panic")
        .expect("device server should stop cleanly");
    assert!(!server.is_initialized());
    assert!(!server.socket_path().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn runner_reregisters_after_socket_removal() {
    let mut host = Host::start();
    let server = Arc::new(host.server());
    let backoff = Backoff::new(vec![Duration::from_millis(50)]).expect("non-empty schedule");
    let mut runner = SupervisedRunner::new(server.clone(), backoff);
    runner.start();

    host.next_registration().await;
    wait_until_initialized(&server).await;

    // what the kubelet does to every plugin socket when it restarts
    std::fs::remove_file(server.socket_path()).expect("should remove plugin socket");

    let registration = host.next_registration().await;
    assert_eq!(registration.resource_name, RESOURCE);
    wait_until_initialized(&server).await;
    assert!(server.socket_path().exists());

    let worker = runner.stop().expect("runner should be started");
    tokio::time::timeout(WAIT, worker)
        .await
        .expect("runner should stop")
        .expect("runner should not panic");
    assert!(!server.is_initialized());
    assert!(!server.socket_path().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn start_fails_without_kubelet() {
    let host = Host::start();
    host.kubelet_stop.cancel();
    std::fs::remove_file(host.path().join("device-plugins/kubelet.sock"))
        .expect("should remove kubelet socket");
    let server = host.server();

    let err = tokio::time::timeout(WAIT * 2, server.start(CancellationToken::new()))
        .await
        .expect("registration should give up")
        .expect_err("registration should fail");
    assert!(matches!(
        err.current_context(),
        vfio_device_plugin::device_plugin::DeviceServerError::Registration
    ));
    assert!(!server.socket_path().exists());
}
