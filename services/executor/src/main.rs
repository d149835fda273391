//! scorchd - the per-node microVM executor daemon.
//!
//! Wires the executor components together, recovers persisted VM records,
//! and converts SIGINT/SIGTERM into graceful cleanup of every tracked VM.
//! The orchestrator-facing transport lives outside this binary.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scorch_executor::config::Config;
use scorch_executor::executor::Executor;
use scorch_executor::image::DockerImagePreparer;
use scorch_executor::network::BridgeNetworkManager;
use scorch_executor::state::StateStore;
use scorch_executor::translate::TaskTranslator;
use scorch_executor::vmm::{FirecrackerManager, VmmManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        kernel = %config.kernel_path.display(),
        rootfs_dir = %config.rootfs_dir.display(),
        socket_dir = %config.socket_dir.display(),
        bridge = %config.network.bridge_name,
        "Starting scorchd"
    );

    let store = Arc::new(StateStore::open_default()?);
    info!(state_file = %store.path().display(), "State store opened");

    let vmm = Arc::new(FirecrackerManager::new(&config, store.clone()));
    let recovered = vmm.recover().await;
    if recovered > 0 {
        info!(recovered, "Recovered persisted VM records");
    }

    let network = Arc::new(BridgeNetworkManager::new(config.network.clone())?);
    let translator = Arc::new(TaskTranslator::new(&config));
    let image = Arc::new(DockerImagePreparer::new(&config));

    let executor = Arc::new(Executor::new(translator, image, network, vmm.clone()));

    // Mirror the status event stream into the structured log.
    let mut events = executor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(task_id = %event.task_id, phase = %event.phase, message = ?event.message, "Task event");
        }
    });

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;

    info!("scorchd ready");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }
    shutdown.cancel();

    // Graceful cleanup: stop every VM we still track. Records stay in the
    // state file (now stopped) so operator tooling keeps visibility.
    for vm in store.list() {
        if vm.state.is_terminal() {
            continue;
        }
        info!(task_id = %vm.task_id, "Stopping VM for shutdown");
        // Fresh token per stop: the graceful grace period still applies.
        if let Err(e) = vmm.stop(&vm.task_id, &CancellationToken::new()).await {
            warn!(task_id = %vm.task_id, error = %e, "Shutdown stop failed");
        }
    }

    info!("scorchd shutdown complete");
    Ok(())
}
