//! Fixed-interval scheduling of the rental sweeps.

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vmrent_core::{BatchReport, Result, VmController};

use crate::config::SweepConfig;

/// One recurring job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sweep {
    Inventory,
    Expiry,
    Provision,
    Cleanup,
    Health,
    Backup,
}

impl Sweep {
    pub const ALL: [Sweep; 6] = [
        Sweep::Inventory,
        Sweep::Health,
        Sweep::Expiry,
        Sweep::Provision,
        Sweep::Backup,
        Sweep::Cleanup,
    ];

    pub async fn run(&self, controller: &VmController) -> Result<BatchReport> {
        let today = Utc::now().date_naive();
        match self {
            Sweep::Inventory => controller.sync_inventory().await,
            Sweep::Expiry => controller.expire_overdue(today).await,
            Sweep::Provision => controller.provision_pending().await,
            Sweep::Cleanup => controller.cleanup_stale(today).await,
            Sweep::Health => controller.health_check().await,
            Sweep::Backup => controller.auto_backup().await,
        }
    }

    fn interval_secs(&self, config: &SweepConfig) -> u64 {
        match self {
            Sweep::Inventory => config.inventory_interval_secs,
            Sweep::Expiry => config.expiry_interval_secs,
            Sweep::Provision => config.provision_interval_secs,
            Sweep::Cleanup => config.cleanup_interval_secs,
            Sweep::Health => config.health_interval_secs,
            Sweep::Backup => config.backup_interval_secs,
        }
    }
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Sweep::Inventory => "inventory",
            Sweep::Expiry => "expiry",
            Sweep::Provision => "provision",
            Sweep::Cleanup => "cleanup",
            Sweep::Health => "health",
            Sweep::Backup => "backup",
        };
        write!(f, "{}", s)
    }
}

/// Runs every [`Sweep`] on its own interval until shutdown.
pub struct Scheduler {
    controller: Arc<VmController>,
    config: SweepConfig,
}

impl Scheduler {
    pub fn new(controller: Arc<VmController>, config: SweepConfig) -> Self {
        Self { controller, config }
    }

    /// Run one sweep and log its report.
    pub async fn run_sweep(&self, sweep: Sweep) -> Option<BatchReport> {
        debug!(sweep = %sweep, "Running sweep");
        match sweep.run(&self.controller).await {
            Ok(report) => {
                if report.failed > 0 {
                    warn!(
                        sweep = %sweep,
                        examined = report.examined,
                        failed = report.failed,
                        "Sweep completed with failures"
                    );
                } else {
                    debug!(sweep = %sweep, examined = report.examined, "Sweep completed");
                }
                Some(report)
            }
            Err(e) => {
                error!(sweep = %sweep, error = %e, "Sweep failed");
                None
            }
        }
    }

    /// Run every sweep once, in dependency order.
    pub async fn run_once(&self) -> Vec<(Sweep, Option<BatchReport>)> {
        let mut reports = Vec::with_capacity(Sweep::ALL.len());
        for sweep in Sweep::ALL {
            reports.push((sweep, self.run_sweep(sweep).await));
        }
        reports
    }

    /// Start the scheduling loop. The first run of each sweep happens one
    /// interval after start.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let timer = |sweep: Sweep| {
            let period = SweepConfig::interval(sweep.interval_secs(&self.config));
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        };
        let mut inventory = timer(Sweep::Inventory);
        let mut expiry = timer(Sweep::Expiry);
        let mut provision = timer(Sweep::Provision);
        let mut cleanup = timer(Sweep::Cleanup);
        let mut health = timer(Sweep::Health);
        let mut backup = timer(Sweep::Backup);

        info!(
            inventory_secs = self.config.inventory_interval_secs,
            expiry_secs = self.config.expiry_interval_secs,
            provision_secs = self.config.provision_interval_secs,
            cleanup_secs = self.config.cleanup_interval_secs,
            health_secs = self.config.health_interval_secs,
            backup_secs = self.config.backup_interval_secs,
            "Starting sweep scheduler"
        );

        loop {
            let sweep = tokio::select! {
                _ = inventory.tick() => Sweep::Inventory,
                _ = expiry.tick() => Sweep::Expiry,
                _ = provision.tick() => Sweep::Provision,
                _ = cleanup.tick() => Sweep::Cleanup,
                _ = health.tick() => Sweep::Health,
                _ = backup.tick() => Sweep::Backup,
                _ = shutdown.recv() => {
                    info!("Sweep scheduler shutting down");
                    break;
                }
            };
            self.run_sweep(sweep).await;
        }
    }
}
