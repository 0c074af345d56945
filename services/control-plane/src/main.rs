//! LRP Control Plane
//!
//! Tracks desired and actual long-running processes, reconciles one against
//! the other, and streams every state change to subscribers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lrp_control_plane::{
    actual::{ActualLrpController, ConvergenceWorker},
    api,
    collaborators::{
        Collaborators, HttpAuctionDispatcher, HttpCellClient, ShutdownNotifier,
        StaticServiceDiscovery, WatchShutdown,
    },
    config,
    desired::DesiredLrpReconciler,
    emitter::EventEmitter,
    state::AppState,
    storage::MemoryStore,
    stream::Streamer,
};
use lrp_events::EventHub;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LRP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting LRP control plane");
    info!(
        listen_addr = %config.listen_addr,
        update_workers = config.update_workers,
        cells = config.cells.len(),
        "Configuration loaded"
    );

    let desired_hub = EventHub::new("desired", config.hub_capacity);
    let actual_hub = EventHub::new("actual", config.hub_capacity);
    for hub in [&desired_hub, &actual_hub] {
        let name = hub.name();
        hub.register_callback(move |subscribers| {
            info!(hub = name, subscribers, "Event hub subscribers changed");
        });
    }
    let (emitter, emitter_handle) = EventEmitter::spawn(desired_hub.clone(), actual_hub.clone());

    // Raised on ctrl-c and on unrecoverable storage errors.
    let (shutdown, mut shutdown_rx) = WatchShutdown::new();
    let shutdown = Arc::new(shutdown);

    let collaborators = Collaborators {
        auctioneer: Arc::new(HttpAuctionDispatcher::new(config.auctioneer_url.clone())?),
        discovery: Arc::new(StaticServiceDiscovery::new(config.cells.clone())),
        cells: Arc::new(HttpCellClient::new()?),
        shutdown: shutdown.clone(),
    };

    let store = Arc::new(MemoryStore::new());
    let controller = ActualLrpController::new(store, emitter, collaborators)
        .with_restart_policy(Arc::new(config.restart_policy.clone()));
    let reconciler = DesiredLrpReconciler::new(controller.clone(), config.update_workers);

    let convergence_worker = ConvergenceWorker::new(controller, config.convergence_interval);
    let convergence_handle = tokio::spawn({
        let shutdown_rx = shutdown.subscribe();
        async move {
            convergence_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(
        desired_hub.clone(),
        actual_hub.clone(),
        Streamer::new(config.stream_buffer),
        reconciler,
    );
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown.subscribe();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    let mut server_exited = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = shutdown_rx.wait_for(|stop| *stop) => {
            error!("Shutdown requested after unrecoverable error");
        }
        result = &mut server_handle => {
            server_exited = true;
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    shutdown.notify();

    // Closing the hubs ends every open event stream so graceful shutdown
    // does not wait on them.
    for hub in [&desired_hub, &actual_hub] {
        if let Err(e) = hub.close() {
            warn!(hub = hub.name(), error = %e, "Event hub already closed");
        }
    }

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    if !server_exited {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, server_handle).await {
            warn!(error = %e, "HTTP server did not shut down in time");
        }
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, convergence_handle).await {
        warn!(error = %e, "Convergence worker did not shut down in time");
    }

    // The dispatcher exits once the last emitter clone is gone; it may
    // still be held by in-flight requests.
    if tokio::time::timeout(Duration::from_secs(1), emitter_handle)
        .await
        .is_err()
    {
        warn!("Event dispatcher still running at exit");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
