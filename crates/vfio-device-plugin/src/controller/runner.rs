use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Backoff;
use crate::device_plugin::DeviceServerError;

/// A long-running device endpoint the runner restarts until stopped.
#[async_trait]
pub trait ManagedDevice: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Serve until `stop` is cancelled or the endpoint is lost.
    ///
    /// Returning `Ok` means the device went down cleanly and may be started
    /// again right away; an error moves the restart delay further along the
    /// backoff schedule.
    async fn start(&self, stop: CancellationToken) -> Result<(), Report<DeviceServerError>>;
}

/// Restarts a [`ManagedDevice`] with backoff until stopped.
pub struct SupervisedRunner {
    device: Arc<dyn ManagedDevice>,
    backoff: Backoff,
    stop: Option<CancellationToken>,
    worker: Option<JoinHandle<()>>,
}

impl SupervisedRunner {
    pub fn new(device: Arc<dyn ManagedDevice>, backoff: Backoff) -> Self {
        Self {
            device,
            backoff,
            stop: None,
            worker: None,
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn is_started(&self) -> bool {
        self.stop.is_some()
    }

    /// Spawn the restart loop. Does nothing if it is already running.
    pub fn start(&mut self) {
        if self.is_started() {
            return;
        }

        let stop = CancellationToken::new();
        let device = self.device.clone();
        let backoff = self.backoff.clone();
        tracing::info!("Starting a device plugin for device: {}", device.name());

        self.worker = Some(tokio::spawn(supervise(device, backoff, stop.clone())));
        self.stop = Some(stop);
    }

    /// Signal the restart loop to exit. Does nothing if it isn't running.
    ///
    /// The loop exits on its own once the device returns; the handle of the
    /// worker is handed back for callers that need to wait for that.
    pub fn stop(&mut self) -> Option<JoinHandle<()>> {
        let stop = self.stop.take()?;
        stop.cancel();
        self.worker.take()
    }
}

async fn supervise(device: Arc<dyn ManagedDevice>, backoff: Backoff, stop: CancellationToken) {
    let mut retries = backoff.counter();

    loop {
        match device.start(stop.clone()).await {
            Ok(()) => retries.reset(),
            Err(e) => {
                tracing::error!("Error starting {} device plugin: {e:?}", device.name());
                retries.advance();
            }
        }

        let delay = backoff.delay(&retries);
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!("device plugin {} stopped", device.name());
                return;
            }
            _ = tokio::time::sleep(delay) => {
                tracing::debug!("restarting device plugin {} after {delay:?}", device.name());
            }
        }
    }
}
