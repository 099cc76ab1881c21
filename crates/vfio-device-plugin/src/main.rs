use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use vfio_device_plugin::config::load_resource_config;
use vfio_device_plugin::config::Cli;
use vfio_device_plugin::config::ControllerConfig;
use vfio_device_plugin::controller::DeviceController;
use vfio_device_plugin::discovery::SysfsIntrospector;
use vfio_device_plugin::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.log_dir.as_deref());

    tracing::info!(
        "Starting vfio device plugin {}",
        env!("CARGO_PKG_VERSION")
    );

    let resources = match load_resource_config(&cli.config) {
        Ok(resources) => resources,
        Err(e) => {
            tracing::error!("Failed to create resource config: {e:?}");
            return Ok(());
        }
    };

    let controller = Arc::new(DeviceController::new(
        resources,
        Arc::new(SysfsIntrospector::new(cli.pci_base_path.clone())),
        ControllerConfig::from(&cli),
    ));

    let stop = CancellationToken::new();
    let mut controller_task = tokio::spawn({
        let controller = controller.clone();
        let stop = stop.clone();
        async move { controller.run(stop).await }
    });

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            stop.cancel();
            match controller_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Device controller failed: {e:?}"),
                Err(e) => tracing::error!("Device controller task failed: {e}"),
            }
        }
        finished = &mut controller_task => {
            tracing::warn!("Device controller exited before shutdown: {finished:?}");
        }
    }

    tracing::info!("Device Controller exited, program ending");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}
