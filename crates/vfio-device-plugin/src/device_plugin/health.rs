use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use notify::event::ModifyKind;
use notify::event::RenameMode;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::DeviceServerError;

/// Health transition of one device, sent from the monitor to ListAndWatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHealth {
    pub id: String,
    pub healthy: bool,
}

/// Why the monitor returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorExit {
    Stopped,
    /// The kubelet removed our socket, so the registration is gone.
    SocketRemoved,
}

#[derive(Debug, PartialEq, Eq)]
enum Observation {
    Device(DeviceHealth),
    SocketRemoved,
}

/// Watches device files and the plugin socket of one device server.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    resource_name: String,
    /// Device file as seen from this process, mapped to the device IDs it backs.
    device_paths: HashMap<PathBuf, Vec<String>>,
    socket_path: PathBuf,
}

impl HealthMonitor {
    pub(crate) fn new(
        resource_name: String,
        device_paths: HashMap<PathBuf, Vec<String>>,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            resource_name,
            device_paths,
            socket_path,
        }
    }

    fn watched_dirs(&self) -> BTreeSet<&Path> {
        self.device_paths
            .keys()
            .chain(std::iter::once(&self.socket_path))
            .filter_map(|path| path.parent())
            .collect()
    }

    /// Set up the watches, then report every device that is already missing
    /// on `health`.
    ///
    /// Watches are registered before checking for existence so a removal in
    /// between isn't missed.
    ///
    /// # Errors
    ///
    /// - [`DeviceServerError::HealthCheck`] if the watches can't be set up or
    ///   the plugin socket is missing to begin with
    pub(crate) fn watch(
        self,
        health: mpsc::UnboundedSender<DeviceHealth>,
    ) -> Result<ActiveMonitor, Report<DeviceServerError>> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Receiver is gone once the monitor returned
            let _ = event_tx.send(res);
        })
        .change_context(DeviceServerError::HealthCheck)
        .attach_printable("failed to create a filesystem watcher")?;

        for dir in self.watched_dirs() {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .change_context(DeviceServerError::HealthCheck)
                .attach_printable_lazy(|| format!("failed to watch {}", dir.display()))?;
        }

        for (path, ids) in &self.device_paths {
            let present = path
                .try_exists()
                .change_context(DeviceServerError::HealthCheck)
                .attach_printable_lazy(|| format!("could not stat device {}", path.display()))?;
            if present {
                tracing::info!("device '{}' is present.", path.display());
            } else {
                tracing::warn!(
                    "device '{}' is not present, the device plugin can't expose it.",
                    path.display()
                );
                for id in ids {
                    let _ = health.send(DeviceHealth {
                        id: id.clone(),
                        healthy: false,
                    });
                }
            }
        }

        if !self.socket_path.exists() {
            return Err(Report::new(DeviceServerError::HealthCheck).attach_printable(format!(
                "device plugin socket {} does not exist",
                self.socket_path.display()
            )));
        }

        Ok(ActiveMonitor {
            monitor: self,
            health,
            events,
            _watcher: watcher,
        })
    }

    /// Translate one filesystem event into health changes.
    fn observe(&self, event: &Event) -> Vec<Observation> {
        let healthy = match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => true,
            EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::Any)) => false,
            _ => return Vec::new(),
        };

        let mut observations = Vec::new();
        for path in &event.paths {
            if let Some(ids) = self.device_paths.get(path) {
                observations.extend(ids.iter().map(|id| {
                    Observation::Device(DeviceHealth {
                        id: id.clone(),
                        healthy,
                    })
                }));
            } else if *path == self.socket_path && matches!(event.kind, EventKind::Remove(_)) {
                observations.push(Observation::SocketRemoved);
            }
        }
        observations
    }
}

/// A [`HealthMonitor`] whose watches are in place.
pub(crate) struct ActiveMonitor {
    monitor: HealthMonitor,
    health: mpsc::UnboundedSender<DeviceHealth>,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl ActiveMonitor {
    /// Report health transitions until `stop` fires or the plugin socket
    /// disappears.
    ///
    /// # Errors
    ///
    /// - [`DeviceServerError::HealthCheck`] if the watcher stops delivering events
    #[tracing::instrument(skip_all, fields(resource = %self.monitor.resource_name))]
    pub(crate) async fn run(
        mut self,
        stop: CancellationToken,
    ) -> Result<MonitorExit, Report<DeviceServerError>> {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(MonitorExit::Stopped),
                event = self.events.recv() => match event {
                    Some(Ok(event)) => {
                        tracing::debug!("health event: {event:?}");
                        for observation in self.monitor.observe(&event) {
                            match observation {
                                Observation::Device(update) => {
                                    if update.healthy {
                                        tracing::info!("monitored device {} appeared", update.id);
                                    } else {
                                        tracing::info!("monitored device {} disappeared", update.id);
                                    }
                                    let _ = self.health.send(update);
                                }
                                Observation::SocketRemoved => {
                                    tracing::info!(
                                        "device plugin socket {} was removed, kubelet probably restarted.",
                                        self.monitor.socket_path.display()
                                    );
                                    return Ok(MonitorExit::SocketRemoved);
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!("error watching devices and device plugin directory: {e:?}");
                    }
                    None => {
                        return Err(Report::new(DeviceServerError::HealthCheck)
                            .attach_printable("filesystem watcher stopped"));
                    }
                },
            }
        }
    }
}
