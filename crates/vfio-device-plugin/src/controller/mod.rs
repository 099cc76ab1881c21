//! Discovers configured devices and supervises one device server per resource name.

mod backoff;
mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::config::ResourceSpec;
use crate::device_plugin::DeviceServer;
use crate::discovery;
use crate::discovery::DiscoveryError;
use crate::discovery::PciIntrospector;
use crate::discovery::ResourceGroup;

pub use backoff::Backoff;
pub use backoff::RetryCounter;
pub use runner::ManagedDevice;
pub use runner::SupervisedRunner;

/// How long shutdown waits for device servers to deregister and clean up.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("device discovery interrupted")]
    DiscoveryInterrupted,
}

pub struct DeviceController {
    resources: Vec<ResourceSpec>,
    introspector: Arc<dyn PciIntrospector>,
    config: ControllerConfig,
    started_plugins: Mutex<HashMap<String, SupervisedRunner>>,
}

impl DeviceController {
    pub fn new(
        resources: Vec<ResourceSpec>,
        introspector: Arc<dyn PciIntrospector>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            resources,
            introspector,
            config,
            started_plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Names of the resources whose device servers are currently supervised.
    pub async fn running_resources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.started_plugins.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Discover devices, serve every configured resource and tear everything
    /// down once `stop` is cancelled.
    ///
    /// Discovery runs once per call; device topology is taken as static for
    /// the lifetime of the daemon.
    ///
    /// # Errors
    ///
    /// - [`ControllerError::DiscoveryInterrupted`] if `stop` fires before a
    ///   discovery attempt succeeded, in which case nothing was started
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, stop: CancellationToken) -> Result<(), Report<ControllerError>> {
        let groups = self.discover_with_retry(&stop).await?;

        let devices: Vec<Arc<dyn ManagedDevice>> = groups
            .into_iter()
            .map(|group| {
                Arc::new(DeviceServer::new(group, self.config.server.clone()))
                    as Arc<dyn ManagedDevice>
            })
            .collect();

        {
            let mut started = self.started_plugins.lock().await;
            for device in devices {
                tracing::info!("Starting device plugin for {}", device.name());
                Self::start_device(&mut started, device, &self.config.backoff);
            }
        }
        tracing::info!("Starting device plugin controller");

        stop.cancelled().await;

        let workers: Vec<_> = {
            let mut started = self.started_plugins.lock().await;
            let names: Vec<String> = started.keys().cloned().collect();
            names
                .iter()
                .filter_map(|name| Self::stop_device(&mut started, name))
                .collect()
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(workers))
            .await
            .is_err()
        {
            tracing::warn!("device plugins did not stop within {SHUTDOWN_TIMEOUT:?}");
        }
        tracing::info!("Shutting down device plugin controller");
        Ok(())
    }

    async fn discover_with_retry(
        &self,
        stop: &CancellationToken,
    ) -> Result<Vec<ResourceGroup>, Report<ControllerError>> {
        let retry_interval = self.config.discovery_retry_interval;

        loop {
            match self.discover() {
                Ok(groups) => return Ok(groups),
                Err(e) => {
                    tracing::error!(
                        "failed to discover configured VFIO devices, will retry in {retry_interval:?}: {e:?}"
                    );
                }
            }

            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::info!("Received stop signal before successful discovery");
                    return Err(Report::new(ControllerError::DiscoveryInterrupted));
                }
                _ = tokio::time::sleep(retry_interval) => {}
            }
        }
    }

    fn discover(&self) -> Result<Vec<ResourceGroup>, Report<DiscoveryError>> {
        let devices = discovery::discover_devices(&self.resources, self.introspector.as_ref())
            .accept(self.config.discovery_policy)?;
        Ok(discovery::build_resource_groups(&self.resources, devices))
    }

    fn start_device(
        started: &mut HashMap<String, SupervisedRunner>,
        device: Arc<dyn ManagedDevice>,
        backoff: &Backoff,
    ) {
        let name = device.name().to_string();
        Self::stop_device(started, &name);

        let mut runner = SupervisedRunner::new(device, backoff.clone());
        runner.start();
        started.insert(name, runner);
    }

    fn stop_device(
        started: &mut HashMap<String, SupervisedRunner>,
        name: &str,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut runner = started.remove(name)?;
        runner.stop()
    }
}
