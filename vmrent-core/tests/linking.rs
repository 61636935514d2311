//! Integration tests for importing pre-existing backend instances.

mod common;

use common::{fixture_with, proxmox_settings, Fixture};
use vmrent_core::*;
use vmrent_hypervisor::{BackendKind, HypervisorError, InstanceConfig, InstanceKind, MockBackend, PowerState};

fn config(cores: u32, memory_mib: u64, disk_gib: u64) -> InstanceConfig {
    InstanceConfig {
        cores,
        memory_mib,
        disk_gib,
        kind: InstanceKind::Vm,
    }
}

/// Demo backend plus two instances created outside the rental system.
async fn legacy_fixture() -> Fixture {
    let backend = MockBackend::demo(BackendKind::Proxmox)
        .with_instance("pve1", "101", "legacy-web", PowerState::Running, config(4, 4096, 50))
        .with_instance("pve1", "102", "legacy-db", PowerState::Stopped, config(2, 8192, 200));
    fixture_with(RentalSettings::default(), backend).await
}

/// Fetch stages remote instances that no record references yet.
#[tokio::test]
async fn test_fetch_excludes_linked_instances() {
    let f = legacy_fixture().await;
    let own = f.active_vm("web-01").await;

    let mut job = f.controller.start_linking(f.server.id, f.customer).await.unwrap();
    let staged = f.controller.fetch_linking(&mut job).await.unwrap();

    assert_eq!(staged, 2);
    assert_eq!(job.state, LinkingState::Fetched);
    let references: Vec<&str> = job.lines.iter().map(|l| l.reference.as_str()).collect();
    assert_eq!(references, vec!["101", "102"]);
    assert!(!references.contains(&Fixture::reference(&own).as_str()));
    assert!(job.lines.iter().all(|l| !l.selected));
}

/// Linked instances take their resources and power state from the backend.
#[tokio::test]
async fn test_link_uses_live_configuration() {
    let f = legacy_fixture().await;
    let mut job = f.controller.start_linking(f.server.id, f.customer).await.unwrap();
    f.controller.fetch_linking(&mut job).await.unwrap();
    job.select(&["101", "102"]);

    let report = f.controller.link_selected(&mut job).await.unwrap();

    assert_eq!(job.state, LinkingState::Done);
    assert_eq!(report.created.len(), 2);
    assert!(report.fallbacks.is_empty());

    let web = report.created.iter().find(|vm| vm.name == "legacy-web").unwrap();
    assert_eq!(web.resources, ResourceSpec::new(4, 4096, 50));
    assert_eq!(web.state, VmState::Active);
    assert_eq!(web.node_id, Some(f.node.id));
    assert_eq!(web.customer_id, f.customer);
    assert!(web.end_date.is_none());

    let db = report.created.iter().find(|vm| vm.name == "legacy-db").unwrap();
    assert_eq!(db.state, VmState::Stopped);
    assert_eq!(Fixture::reference(db), "102");

    assert_eq!(f.audit.for_instance(web.id)[0].action, AuditAction::Link);

    // linked instances are managed like any other
    let db = f.controller.start(db.id).await.unwrap();
    assert_eq!(db.state, VmState::Active);
    assert_eq!(f.backend.power_state("102"), Some(PowerState::Running));
}

/// An unreadable configuration falls back to the defaults of the kind.
#[tokio::test]
async fn test_link_falls_back_when_config_unavailable() {
    let f = legacy_fixture().await;
    let mut job = f.controller.start_linking(f.server.id, f.customer).await.unwrap();
    f.controller.fetch_linking(&mut job).await.unwrap();
    job.select(&["101"]);
    f.backend
        .fail_on("get_vm_config", HypervisorError::Operation("config locked".to_string()));

    let report = f.controller.link_selected(&mut job).await.unwrap();

    assert_eq!(report.created.len(), 1);
    assert_eq!(report.fallbacks, vec!["101".to_string()]);
    assert_eq!(report.created[0].resources, ResourceSpec::fallback_for(InstanceKind::Vm));
}

/// A second fetch after linking finds nothing left to import.
#[tokio::test]
async fn test_refetch_after_linking() {
    let f = legacy_fixture().await;
    let mut job = f.controller.start_linking(f.server.id, f.customer).await.unwrap();
    f.controller.fetch_linking(&mut job).await.unwrap();
    job.select(&["101", "102"]);
    f.controller.link_selected(&mut job).await.unwrap();

    assert!(matches!(
        f.controller.fetch_linking(&mut job).await.unwrap_err(),
        RentalError::InvalidState(_)
    ));

    let mut again = f.controller.start_linking(f.server.id, f.customer).await.unwrap();
    assert_eq!(f.controller.fetch_linking(&mut again).await.unwrap(), 0);
}

/// Linking needs a fetched job with at least one selected line.
#[tokio::test]
async fn test_link_requires_selection() {
    let f = legacy_fixture().await;
    let mut job = f.controller.start_linking(f.server.id, f.customer).await.unwrap();

    assert!(matches!(
        f.controller.link_selected(&mut job).await.unwrap_err(),
        RentalError::InvalidState(_)
    ));

    f.controller.fetch_linking(&mut job).await.unwrap();
    assert!(matches!(
        f.controller.link_selected(&mut job).await.unwrap_err(),
        RentalError::Validation(_)
    ));
    assert_eq!(job.state, LinkingState::Fetched);
}

/// Fetching from a server that was never synchronized is refused.
#[tokio::test]
async fn test_fetch_requires_synchronized_nodes() {
    let f = legacy_fixture().await;
    let server = f
        .controller
        .register_server("unsynced", proxmox_settings(common::HOST))
        .await
        .unwrap();
    let mut job = f.controller.start_linking(server.id, f.customer).await.unwrap();

    let err = f.controller.fetch_linking(&mut job).await.unwrap_err();

    assert!(matches!(err, RentalError::Validation(_)));
    assert!(err.to_string().contains("No nodes found"));
}
