//! Scheduled sweeps over all instances and servers.
//!
//! Each sweep is idempotent and handles every record independently: an error
//! on one instance is logged and counted, never propagated.

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vmrent_common::TimedOperation;

use crate::audit::AuditAction;
use crate::controller::VmController;
use crate::error::{RentalError, Result};
use crate::model::{VmInstance, VmState};

/// Outcome of one operation applied to many records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub examined: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed records with their error
    pub errors: Vec<(Uuid, String)>,
}

impl BatchReport {
    pub fn push(&mut self, id: Uuid, outcome: Result<()>) {
        self.examined += 1;
        match outcome {
            Ok(()) => self.succeeded += 1,
            Err(e) => {
                self.failed += 1;
                self.errors.push((id, e.to_string()));
            }
        }
    }
}

impl VmController {
    async fn instances_where<F>(&self, filter: F) -> Result<Vec<VmInstance>>
    where
        F: Fn(&VmInstance) -> bool,
    {
        Ok(self
            .repository()
            .list_instances()
            .await?
            .into_iter()
            .filter(|vm| filter(vm))
            .collect())
    }

    /// Suspend every active instance whose rental ended before `today`.
    ///
    /// A failed backend suspend is logged; the instance is suspended locally
    /// regardless.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, today: NaiveDate) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        if !self.settings().auto_suspend_expired {
            return Ok(report);
        }
        let expired = self
            .instances_where(|vm| vm.state == VmState::Active && vm.is_expired(today))
            .await?;
        for vm in expired {
            let outcome = self.suspend_expired(vm.id).await;
            report.push(vm.id, outcome);
        }
        if report.examined > 0 {
            info!(examined = report.examined, failed = report.failed, "Expired instances suspended");
        }
        Ok(report)
    }

    async fn suspend_expired(&self, id: Uuid) -> Result<()> {
        let timer = TimedOperation::start("suspend");
        let result = async {
            let _claim = self.claim(id)?;
            let mut vm = self.instance(id).await?;
            if vm.state != VmState::Active {
                return Ok(());
            }
            if let Some(placement) = vm.backend.clone() {
                let suspend = async {
                    let adapter = self.adapter_for(vm.server_id).await?;
                    adapter.suspend(&placement.node, &placement.reference).await?;
                    Ok::<_, RentalError>(())
                };
                if let Err(e) = suspend.await {
                    warn!(vm_id = %id, reference = %placement.reference, error = %e, "Backend suspend failed for expired instance");
                }
            }
            vm.state = VmState::Suspended;
            self.repository().save_instance(&vm).await?;
            info!(vm_id = %id, end_date = ?vm.end_date, "Instance suspended after rental expiry");
            Ok(())
        }
        .await;
        self.record(id, AuditAction::Suspend, &timer, &result, json!({"reason": "expired"}))
            .await;
        result
    }

    /// Provision every pending instance that has its placement selected.
    #[instrument(skip(self))]
    pub async fn provision_pending(&self) -> Result<BatchReport> {
        let pending = self
            .instances_where(|vm| {
                vm.state == VmState::Pending
                    && vm.node_id.is_some()
                    && vm.storage_id.is_some()
                    && vm.template_id.is_some()
            })
            .await?;
        let mut report = BatchReport::default();
        for vm in pending {
            let outcome = self.provision(vm.id).await.map(|_| ());
            report.push(vm.id, outcome);
        }
        if report.examined > 0 {
            info!(examined = report.examined, failed = report.failed, "Pending instances provisioned");
        }
        Ok(report)
    }

    /// Archive terminated instances whose rental ended more than
    /// `archive_after_days` before `today`, then prune old automatic
    /// backups.
    #[instrument(skip(self))]
    pub async fn cleanup_stale(&self, today: NaiveDate) -> Result<BatchReport> {
        let cutoff = today - Duration::days(i64::from(self.settings().archive_after_days));
        let stale = self
            .instances_where(|vm| {
                let ended = vm.end_date.unwrap_or_else(|| vm.created_at.date_naive());
                vm.state == VmState::Terminated && ended < cutoff
            })
            .await?;
        let mut report = BatchReport::default();
        for vm in stale {
            let outcome = self.archive(vm.id).await.map(|_| ());
            report.push(vm.id, outcome);
        }

        match self.cleanup_old_backups(self.settings().backup_retention_days).await {
            Ok(pruned) => info!(archived = report.succeeded, pruned_backups = pruned, "Stale records cleaned up"),
            Err(e) => warn!(error = %e, "Pruning old backups failed"),
        }
        Ok(report)
    }

    /// Ask every server for its version and record its connection status.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<BatchReport> {
        let servers = self.repository().list_servers().await?;
        let mut report = BatchReport::default();
        for server in servers {
            let outcome = self.check_health(server.id).await.map(|_| ());
            if let Err(e) = &outcome {
                warn!(server_id = %server.id, server = %server.name, error = %e, "Server health check failed");
            }
            report.push(server.id, outcome);
        }
        Ok(report)
    }

    /// Reconcile the cached inventory of every server.
    #[instrument(skip(self))]
    pub async fn sync_inventory(&self) -> Result<BatchReport> {
        let servers = self.repository().list_servers().await?;
        let mut report = BatchReport::default();
        for server in servers {
            let outcome = self.test_connection(server.id).await.map(|sync| {
                if !sync.is_unchanged() {
                    info!(server = %server.name, nodes_added = sync.nodes_added, storages_added = sync.storages_added, templates_added = sync.templates_added, "Inventory changed");
                }
            });
            report.push(server.id, outcome);
        }
        Ok(report)
    }

    /// Take an automatic config backup of every running, stopped or
    /// suspended instance.
    #[instrument(skip(self))]
    pub async fn auto_backup(&self) -> Result<BatchReport> {
        let live = self
            .instances_where(|vm| matches!(vm.state, VmState::Active | VmState::Stopped | VmState::Suspended))
            .await?;
        let mut report = BatchReport::default();
        for vm in live {
            let outcome = self.create_auto_backup(vm.id).await.map(|_| ());
            report.push(vm.id, outcome);
        }
        Ok(report)
    }
}
