//! Turu daemon entry point.
//!
//! Follows Docker container lifecycle events and keeps APISIX routes in
//! sync with the endpoints of running containers.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

mod config;
mod error;
mod labels;
mod registry;
mod route;
mod runtime;
mod types;
mod worker;

use config::Config;
use registry::Dispatcher;
use runtime::{ContainerRuntime, DockerRuntime};
use worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!(
        "Starting Turu with backends {:?}, {} workers",
        cfg.configured_backends(),
        cfg.workers
    );

    // Backends with a configuration section must be reachable at startup
    let dispatcher = Arc::new(Dispatcher::from_config(&cfg));
    for selector in cfg.configured_backends() {
        dispatcher
            .construct(selector)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to construct {} backend: {}", selector, e))?;
        info!("Backend {} ready", selector);
    }

    // Event channel
    let (event_tx, event_rx) = mpsc::channel(cfg.queue_capacity);

    // Container Runtime (Docker)
    let runtime = DockerRuntime::new(cfg.sync_on_startup);
    let runtime_handle = tokio::spawn(async move {
        if let Err(e) = runtime.monitor(event_tx).await {
            error!("Container runtime failed: {}", e);
        }
    });

    // Event workers
    let pool = WorkerPool::spawn(Arc::clone(&dispatcher), cfg.workers, cfg.queue_capacity);
    let pump = worker::pump(event_rx, &pool);

    // Graceful Shutdown
    tokio::select! {
        _ = pump => {
            error!("Event stream stopped unexpectedly");
        }
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        },
    }

    // Stop following events, then let workers finish what is queued
    runtime_handle.abort();
    pool.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}
