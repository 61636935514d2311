//! # vmrent Daemon
//!
//! Runs the rental lifecycle for the hypervisor servers named in its
//! configuration: registers each server, synchronizes its inventory and then
//! runs the expiry, provisioning, cleanup, health and backup sweeps on fixed
//! intervals until interrupted.
//!
//! ## Usage
//! ```bash
//! vmrent-daemon --config /etc/vmrent/daemon.yaml
//! vmrent-daemon --dev --once
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use vmrent_common::{init_logging_with_format, LogFormat};
use vmrent_core::{MemoryRepository, TracingAuditSink, VmController};
use vmrent_hypervisor::{AdapterCache, AdapterFactory, BackendConnector, MockConnector};

mod cli;
mod config;
mod scheduler;

use cli::Args;
use config::DaemonConfig;
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = DaemonConfig::resolve(&args)?;

    init_logging_with_format(&config.logging.level, LogFormat::parse(&config.logging.format))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        servers = config.servers.len(),
        dev = config.dev,
        "Starting vmrent daemon"
    );

    let factory: Arc<dyn AdapterFactory> = if config.dev {
        info!("Using mock hypervisor backends");
        Arc::new(MockConnector::seeded())
    } else {
        Arc::new(BackendConnector::default())
    };
    let controller = Arc::new(VmController::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(AdapterCache::new(factory)),
        Arc::new(TracingAuditSink),
        config.rental.clone(),
    ));

    for definition in &config.servers {
        let server = controller
            .register_server(&definition.name, definition.connection.clone())
            .await
            .with_context(|| format!("Failed to register server {}", definition.name))?;

        match controller.test_connection(server.id).await {
            Ok(report) => info!(
                server = %server.name,
                version = %report.version,
                nodes = report.nodes_added,
                storages = report.storages_added,
                templates = report.templates_added,
                "Initial inventory synchronized"
            ),
            Err(e) => warn!(server = %server.name, error = %e, "Initial inventory synchronization failed"),
        }
    }

    let scheduler = Scheduler::new(controller, config.sweeps);

    if args.once {
        let reports = scheduler.run_once().await;
        for (sweep, report) in reports {
            if let Some(report) = report {
                info!(
                    sweep = %sweep,
                    examined = report.examined,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "Sweep finished"
                );
            }
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    handle.await.context("Sweep scheduler panicked")?;

    info!("vmrent daemon stopped");
    Ok(())
}
