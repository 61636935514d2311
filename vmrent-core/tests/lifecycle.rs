//! Integration tests for the VM lifecycle controller.
//!
//! These run the controller against an in-memory repository and a mock
//! Proxmox-style backend with injected failures.

mod common;

use chrono::{Days, Duration, Months, Utc};
use common::{fixture, fixture_with, Fixture};
use vmrent_core::*;
use vmrent_hypervisor::{BackendKind, HypervisorError, MockBackend, PowerState};

/// Provisioning a pending VM activates it with a one-month rental.
#[tokio::test]
async fn test_provision_happy_path() {
    let f = fixture().await;
    let vm = f.pending_vm("web-01").await;

    let outcome = f.controller.provision(vm.id).await.unwrap();

    let vm = f.controller.instance(vm.id).await.unwrap();
    let today = Utc::now().date_naive();
    assert_eq!(vm.state, VmState::Active);
    assert_eq!(outcome.node, "pve1");
    assert!(!outcome.reference.is_empty());
    assert!(outcome.root_password.is_none());
    assert_eq!(Fixture::reference(&vm), outcome.reference);
    assert_eq!(vm.start_date, Some(today));
    assert_eq!(vm.end_date, today.checked_add_months(Months::new(1)));
    assert_eq!(f.backend.power_state(&outcome.reference), Some(PowerState::Running));
    assert!(f.backend.calls().iter().any(|c| c.starts_with("create_vm")));

    let events = f.audit.for_instance(vm.id);
    assert_eq!(events[0].action, AuditAction::Provision);
    assert!(events[0].success);
}

/// A trial rental ends after the configured number of days.
#[tokio::test]
async fn test_trial_rental_period() {
    let f = fixture().await;
    let vm = VmInstance::new("trial-01", f.customer, f.server.id, ResourceSpec::new(1, 1024, 10))
        .with_placement(&f.node, &f.storage, &f.vm_template)
        .with_trial(true);
    let vm = f.controller.create_instance(vm).await.unwrap();

    f.controller.provision(vm.id).await.unwrap();

    let vm = f.controller.instance(vm.id).await.unwrap();
    let today = Utc::now().date_naive();
    assert_eq!(vm.end_date, today.checked_add_days(Days::new(7)));
}

/// Provision only runs from pending.
#[tokio::test]
async fn test_provision_requires_pending() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;

    let err = f.controller.provision(vm.id).await.unwrap_err();

    assert!(matches!(err, RentalError::InvalidState(_)));
    assert_eq!(f.backend.instance_count(), 1);
}

/// Missing placement is a validation error that never reaches the backend.
#[tokio::test]
async fn test_provision_requires_placement() {
    let f = fixture().await;
    let vm = VmInstance::new("bare", f.customer, f.server.id, ResourceSpec::new(1, 1024, 10));
    let vm = f.controller.create_instance(vm).await.unwrap();

    let err = f.controller.provision(vm.id).await.unwrap_err();

    assert!(matches!(err, RentalError::Validation(_)));
    let vm = f.controller.instance(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Pending);
    assert!(!f.backend.calls().iter().any(|c| c.starts_with("create_vm")));
}

/// A backend failure leaves the VM failed and unplaced; retries go through
/// pending again and land in failed until the backend recovers.
#[tokio::test]
async fn test_failed_provision_and_retry() {
    let f = fixture().await;
    let vm = f.pending_vm("web-01").await;
    f.backend
        .fail_on("create_vm", HypervisorError::Operation("clone failed: storage full".to_string()));

    assert!(f.controller.provision(vm.id).await.is_err());
    let failed = f.controller.instance(vm.id).await.unwrap();
    assert_eq!(failed.state, VmState::Failed);
    assert!(failed.backend.is_none());
    assert!(failed.last_error.as_deref().unwrap_or("").contains("storage full"));

    assert!(f.controller.retry_provisioning(vm.id).await.is_err());
    assert_eq!(f.controller.instance(vm.id).await.unwrap().state, VmState::Failed);

    f.backend.clear_failure("create_vm");
    f.controller.retry_provisioning(vm.id).await.unwrap();
    let vm = f.controller.instance(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Active);
    assert!(vm.last_error.is_none());
    assert!(vm.is_provisioned());
}

/// Retry is only valid from failed.
#[tokio::test]
async fn test_retry_requires_failed() {
    let f = fixture().await;
    let vm = f.pending_vm("web-01").await;

    let err = f.controller.retry_provisioning(vm.id).await.unwrap_err();

    assert!(matches!(err, RentalError::InvalidState(_)));
}

/// Two concurrent provisions of one instance create one backend instance.
#[tokio::test]
async fn test_concurrent_provision_is_rejected() {
    let f = fixture().await;
    let vm = f.pending_vm("web-01").await;

    let (a, b) = tokio::join!(f.controller.provision(vm.id), f.controller.provision(vm.id));

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    assert_eq!(f.backend.instance_count(), 1);
}

/// Containers get a generated root password and refuse snapshots.
#[tokio::test]
async fn test_container_provision_and_snapshot_unsupported() {
    let f = fixture().await;
    let ct = f.pending_from("ct-01", &f.ct_template.clone()).await;

    let outcome = f.controller.provision(ct.id).await.unwrap();
    let password = outcome.root_password.expect("root password");
    assert_eq!(password.len(), 16);
    assert!(f.backend.calls().iter().any(|c| c.starts_with("create_container")));

    let err = f.controller.create_snapshot(ct.id, "before-upgrade", "").await.unwrap_err();
    assert!(err.is_unsupported());
    assert!(!f.backend.calls().iter().any(|c| c.starts_with("create_snapshot")));
}

/// Power actions mirror the backend state locally; reboot keeps it.
#[tokio::test]
async fn test_power_actions() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    let reference = Fixture::reference(&vm);

    let vm = f.controller.stop(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Stopped);
    assert_eq!(f.backend.power_state(&reference), Some(PowerState::Stopped));

    let vm = f.controller.start(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Active);

    let vm = f.controller.reboot(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Active);

    let vm = f.controller.suspend(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Suspended);
    assert_eq!(f.backend.power_state(&reference), Some(PowerState::Suspended));
}

/// A failed power action keeps the local state and is audited as failed.
#[tokio::test]
async fn test_power_failure_is_reported() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    f.backend.fail_on("stop", HypervisorError::Operation("VM is locked".to_string()));

    assert!(f.controller.stop(vm.id).await.is_err());

    assert_eq!(f.controller.instance(vm.id).await.unwrap().state, VmState::Active);
    let last = &f.audit.for_instance(vm.id)[0];
    assert_eq!(last.action, AuditAction::Stop);
    assert!(!last.success);
    assert!(last.error_message.as_deref().unwrap_or("").contains("locked"));
}

/// Power actions need a provisioned instance.
#[tokio::test]
async fn test_power_requires_provisioned() {
    let f = fixture().await;
    let vm = f.pending_vm("web-01").await;

    assert!(matches!(
        f.controller.start(vm.id).await.unwrap_err(),
        RentalError::InvalidState(_)
    ));
}

/// Extending a suspended VM restarts it.
#[tokio::test]
async fn test_extend_restarts_suspended() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    f.controller.suspend(vm.id).await.unwrap();
    let before = f.controller.instance(vm.id).await.unwrap().end_date.unwrap();

    let vm = f.controller.extend(vm.id, 2).await.unwrap();

    assert_eq!(vm.state, VmState::Active);
    assert_eq!(vm.end_date, before.checked_add_months(Months::new(2)));
}

/// A failed restart does not fail the extension.
#[tokio::test]
async fn test_extend_survives_restart_failure() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    f.controller.suspend(vm.id).await.unwrap();
    f.backend.fail_on("start", HypervisorError::Operation("no quorum".to_string()));

    let vm = f.controller.extend(vm.id, 1).await.unwrap();

    assert_eq!(vm.state, VmState::Suspended);
    assert!(vm.end_date.unwrap() > Utc::now().date_naive());
}

/// An end date in the past is extended from today.
#[tokio::test]
async fn test_extend_counts_from_today_when_expired() {
    let f = fixture().await;
    let mut vm = f.active_vm("web-01").await;
    let today = Utc::now().date_naive();
    vm.start_date = Some(today - Duration::days(90));
    vm.end_date = Some(today - Duration::days(30));
    f.repo.save_instance(&vm).await.unwrap();

    let vm = f.controller.extend(vm.id, 1).await.unwrap();

    assert_eq!(vm.end_date, today.checked_add_months(Months::new(1)));
    assert!(matches!(
        f.controller.extend(vm.id, 0).await.unwrap_err(),
        RentalError::Validation(_)
    ));
}

/// Terminate deletes the backend instance and refuses a second call.
#[tokio::test]
async fn test_terminate_is_not_idempotent() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;

    let vm = f.controller.terminate(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Terminated);
    assert_eq!(f.backend.instance_count(), 0);

    let err = f.controller.terminate(vm.id).await.unwrap_err();
    assert!(matches!(err, RentalError::InvalidState(_)));

    let vm = f.controller.archive(vm.id).await.unwrap();
    assert_eq!(vm.state, VmState::Archived);
    assert!(f.controller.terminate(vm.id).await.is_err());
}

/// Backend deletion errors do not keep the record open.
#[tokio::test]
async fn test_terminate_swallows_backend_errors() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    f.backend
        .fail_on("delete_vm", HypervisorError::Connection("host unreachable".to_string()));

    let vm = f.controller.terminate(vm.id).await.unwrap();

    assert_eq!(vm.state, VmState::Terminated);
    assert_eq!(f.backend.instance_count(), 1);
}

/// Snapshots are created, rolled back and deleted through the local index.
#[tokio::test]
async fn test_snapshot_lifecycle() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    let reference = Fixture::reference(&vm);

    let snapshot = f
        .controller
        .create_snapshot(vm.id, "before-upgrade", "kernel 6.8")
        .await
        .unwrap();
    assert_eq!(snapshot.name, "before-upgrade");
    assert_eq!(f.backend.snapshots(&reference), vec!["before-upgrade".to_string()]);

    assert!(matches!(
        f.controller.create_snapshot(vm.id, "before-upgrade", "").await.unwrap_err(),
        RentalError::Validation(_)
    ));

    f.controller.rollback_snapshot(vm.id, "before-upgrade").await.unwrap();
    assert!(matches!(
        f.controller.rollback_snapshot(vm.id, "unknown").await.unwrap_err(),
        RentalError::Validation(_)
    ));

    f.controller.delete_snapshot(vm.id, "before-upgrade").await.unwrap();
    assert!(f.backend.snapshots(&reference).is_empty());
    assert!(f.controller.list_snapshots(vm.id).await.unwrap().is_empty());
}

/// Unnamed snapshots get a timestamped name; suspended instances refuse.
#[tokio::test]
async fn test_snapshot_naming_and_state_guard() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;

    let snapshot = f.controller.create_snapshot(vm.id, "  ", "").await.unwrap();
    assert!(snapshot.name.starts_with("snap-"));

    f.controller.suspend(vm.id).await.unwrap();
    assert!(matches!(
        f.controller.create_snapshot(vm.id, "later", "").await.unwrap_err(),
        RentalError::InvalidState(_)
    ));
}

/// The console URL comes from the backend.
#[tokio::test]
async fn test_console_url() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;

    let url = f.controller.console_url(vm.id).await.unwrap();

    assert!(url.contains(&Fixture::reference(&vm)));
}

/// Resource writes are validated and backed up first.
#[tokio::test]
async fn test_resource_update_takes_pre_change_backup() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;

    let err = f
        .controller
        .update_resources(vm.id, ResourceSpec::new(0, 2048, 20))
        .await
        .unwrap_err();
    assert!(matches!(err, RentalError::Validation(_)));
    assert!(f.controller.list_backups(vm.id).await.unwrap().is_empty());

    let updated = f
        .controller
        .update_resources(vm.id, ResourceSpec::new(4, 8192, 40))
        .await
        .unwrap();
    assert_eq!(updated.resources, ResourceSpec::new(4, 8192, 40));

    let backups = f.controller.list_backups(vm.id).await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].kind, BackupKind::PreChange);
    assert_eq!(backups[0].payload().unwrap().cores, 2);

    let restored = f.controller.restore_config_backup(backups[0].id).await.unwrap();
    assert_eq!(restored.resources, ResourceSpec::new(2, 2048, 20));
    assert_eq!(f.controller.list_backups(vm.id).await.unwrap().len(), 2);
}

/// Configured ceilings apply on every write.
#[tokio::test]
async fn test_configured_ceilings() {
    let settings = RentalSettings {
        limits: ResourceLimits {
            max_cores: 4,
            ..ResourceLimits::default()
        },
        ..RentalSettings::default()
    };
    let f = fixture_with(settings, MockBackend::demo(BackendKind::Proxmox)).await;
    let vm = f.pending_vm("web-01").await;

    assert!(f.controller.update_resources(vm.id, ResourceSpec::new(8, 2048, 20)).await.is_err());
    assert!(f.controller.update_resources(vm.id, ResourceSpec::new(4, 2048, 20)).await.is_ok());
}

/// Presets and normalization only apply to pending instances.
#[tokio::test]
async fn test_presets_on_pending_only() {
    let f = fixture().await;
    let pending = f.pending_vm("web-01").await;

    let vm = f.controller.apply_preset(pending.id, ResourcePreset::Large).await.unwrap();
    assert_eq!(vm.resources, ResourceSpec::new(8, 8192, 100));

    let active = f.active_vm("web-02").await;
    assert!(f.controller.apply_preset(active.id, ResourcePreset::Nano).await.is_err());
    assert!(f.controller.normalize_resources(active.id).await.is_err());
}

/// Placement changes must stay on the server and refuse provisioned VMs.
#[tokio::test]
async fn test_update_placement() {
    let f = fixture().await;
    let pending = f.pending_vm("web-01").await;

    let vm = f
        .controller
        .update_placement(pending.id, f.node.id, f.storage.id)
        .await
        .unwrap();
    assert_eq!(vm.node_id, Some(f.node.id));
    assert_eq!(f.controller.list_backups(vm.id).await.unwrap().len(), 1);

    let foreign = Node::new(uuid::Uuid::new_v4(), "elsewhere");
    f.repo.create_nodes(vec![foreign.clone()]).await.unwrap();
    assert!(matches!(
        f.controller.update_placement(pending.id, foreign.id, f.storage.id).await.unwrap_err(),
        RentalError::Validation(_)
    ));

    let active = f.active_vm("web-02").await;
    assert!(matches!(
        f.controller.update_placement(active.id, f.node.id, f.storage.id).await.unwrap_err(),
        RentalError::InvalidState(_)
    ));
}

/// Only automatic backups are pruned by age.
#[tokio::test]
async fn test_cleanup_prunes_auto_backups_only() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    let old = Utc::now() - Duration::days(40);
    for kind in [BackupKind::Auto, BackupKind::Manual, BackupKind::PreChange] {
        let mut backup = ConfigBackup::capture(&vm, kind, None).unwrap();
        backup.created_at = old;
        f.repo.save_backup(backup).await.unwrap();
    }
    f.controller.create_auto_backup(vm.id).await.unwrap();

    let removed = f.controller.cleanup_old_backups(30).await.unwrap();

    assert_eq!(removed, 1);
    let kinds: Vec<BackupKind> = f.controller.list_backups(vm.id).await.unwrap().iter().map(|b| b.kind).collect();
    assert_eq!(kinds.len(), 3);
    assert!(kinds.contains(&BackupKind::Manual));
    assert!(kinds.contains(&BackupKind::PreChange));
}

/// Closed instances do not count towards the customer's rentals.
#[tokio::test]
async fn test_count_active_for_customer() {
    let f = fixture().await;
    let a = f.active_vm("web-01").await;
    f.active_vm("web-02").await;
    f.pending_vm("web-03").await;
    f.controller.terminate(a.id).await.unwrap();

    assert_eq!(f.controller.count_active_for_customer(f.customer).await.unwrap(), 2);
    assert_eq!(f.controller.count_active_for_customer(uuid::Uuid::new_v4()).await.unwrap(), 0);
}

/// New connection settings drop the cached adapter.
#[tokio::test]
async fn test_connection_update_invalidates_adapter() {
    let f = fixture().await;
    let vm = f.active_vm("web-01").await;
    let connects = f.connector.connect_count();

    f.controller.stop(vm.id).await.unwrap();
    assert_eq!(f.connector.connect_count(), connects);

    let server = f
        .controller
        .update_server_connection(f.server.id, common::proxmox_settings(common::HOST))
        .await
        .unwrap();
    assert_eq!(server.status, ConnectionStatus::Untested);

    f.controller.start(vm.id).await.unwrap();
    assert_eq!(f.connector.connect_count(), connects + 1);
}

/// Extending several instances reports each one.
#[tokio::test]
async fn test_extend_many() {
    let f = fixture().await;
    let a = f.active_vm("web-01").await;
    let b = f.active_vm("web-02").await;
    f.controller.terminate(b.id).await.unwrap();

    let report = f.controller.extend_many(&[a.id, b.id], 1).await;

    assert_eq!(report.examined, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.errors[0].0, b.id);
}
