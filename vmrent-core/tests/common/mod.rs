//! Shared fixture: a controller wired to a Proxmox-style mock backend at
//! `10.0.0.5` with node `pve1`, storage `local-lvm`, VM template `9000` and a
//! container template, already synchronized.

#![allow(dead_code)]

use std::sync::Arc;
use uuid::Uuid;
use vmrent_core::*;
use vmrent_hypervisor::{
    AdapterCache, BackendKind, ConnectionSettings, Credentials, InstanceKind, MockBackend, MockConnector,
};

pub const HOST: &str = "10.0.0.5";

pub struct Fixture {
    pub repo: Arc<MemoryRepository>,
    pub backend: Arc<MockBackend>,
    pub connector: Arc<MockConnector>,
    pub audit: Arc<MemoryAuditSink>,
    pub controller: Arc<VmController>,
    pub server: HypervisorServer,
    pub node: Node,
    pub storage: Storage,
    pub vm_template: Template,
    pub ct_template: Template,
    pub customer: Uuid,
}

pub fn proxmox_settings(host: &str) -> ConnectionSettings {
    ConnectionSettings {
        kind: BackendKind::Proxmox,
        host: host.to_string(),
        port: None,
        credentials: Credentials::ApiToken {
            user: "root@pam".to_string(),
            token_name: "rental".to_string(),
            token_value: "00000000-0000-0000-0000-000000000000".to_string(),
        },
        verify_tls: false,
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(RentalSettings::default(), MockBackend::demo(BackendKind::Proxmox)).await
}

pub async fn fixture_with(settings: RentalSettings, backend: MockBackend) -> Fixture {
    let backend = Arc::new(backend);
    let connector = Arc::new(MockConnector::new());
    connector.register(HOST, backend.clone());

    let repo = Arc::new(MemoryRepository::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let adapters = Arc::new(AdapterCache::new(connector.clone()));
    let controller = Arc::new(VmController::new(repo.clone(), adapters, audit.clone(), settings));

    let server = controller
        .register_server("lab", proxmox_settings(HOST))
        .await
        .expect("register server");
    controller.test_connection(server.id).await.expect("initial sync");

    let node = repo.list_nodes(server.id).await.unwrap().remove(0);
    let storage = repo.list_storages(server.id).await.unwrap().remove(0);
    let templates = repo.list_templates(server.id).await.unwrap();
    let vm_template = templates
        .iter()
        .find(|t| t.kind == InstanceKind::Vm)
        .cloned()
        .expect("vm template");
    let ct_template = templates
        .iter()
        .find(|t| t.kind == InstanceKind::Container)
        .cloned()
        .expect("container template");

    Fixture {
        repo,
        backend,
        connector,
        audit,
        controller,
        server,
        node,
        storage,
        vm_template,
        ct_template,
        customer: Uuid::new_v4(),
    }
}

impl Fixture {
    /// A stored pending VM with node, storage and the VM template selected.
    pub async fn pending_vm(&self, name: &str) -> VmInstance {
        self.pending_from(name, &self.vm_template).await
    }

    /// A stored pending instance cloned from `template`.
    pub async fn pending_from(&self, name: &str, template: &Template) -> VmInstance {
        let vm = VmInstance::new(name, self.customer, self.server.id, ResourceSpec::new(2, 2048, 20))
            .with_placement(&self.node, &self.storage, template);
        self.controller.create_instance(vm).await.expect("create instance")
    }

    /// A provisioned, active VM.
    pub async fn active_vm(&self, name: &str) -> VmInstance {
        let vm = self.pending_vm(name).await;
        self.controller.provision(vm.id).await.expect("provision");
        self.controller.instance(vm.id).await.unwrap()
    }

    pub fn reference(vm: &VmInstance) -> String {
        vm.backend.as_ref().map(|b| b.reference.clone()).unwrap_or_default()
    }
}
