//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::factory::AdapterFactory;
use crate::traits::HypervisorClient;
use crate::types::*;

/// Mock hypervisor backend.
///
/// Simulates a backend in memory. Behaves like the Proxmox-style backend
/// (pre-assigned numeric ids, containers supported) or the vCenter-style one
/// (ids generated on creation, VMs only) depending on its [`BackendKind`].
///
/// Failures can be injected per operation with [`MockBackend::fail_on`], and
/// every call is recorded for assertions.
pub struct MockBackend {
    kind: BackendKind,
    state: RwLock<MockState>,
}

struct MockState {
    version: String,
    nodes: Vec<MockNode>,
    instances: HashMap<String, MockInstance>,
    next_id: u32,
    failures: HashMap<&'static str, HypervisorError>,
    calls: Vec<String>,
}

struct MockNode {
    name: String,
    storages: Vec<String>,
    templates: Vec<TemplateInfo>,
}

struct MockInstance {
    node: String,
    name: String,
    power: PowerState,
    config: InstanceConfig,
    snapshots: Vec<String>,
}

impl MockBackend {
    /// Create an empty mock backend.
    pub fn new(kind: BackendKind) -> Self {
        info!(kind = %kind, "Creating mock hypervisor backend");
        Self {
            kind,
            state: RwLock::new(MockState {
                version: format!("{} (mock)", kind.label()),
                nodes: Vec::new(),
                instances: HashMap::new(),
                next_id: 100,
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// A backend with one node, one storage and a VM template, plus a
    /// container template when the backend supports containers.
    pub fn demo(kind: BackendKind) -> Self {
        let backend = Self::new(kind)
            .with_node("pve1")
            .with_storage("pve1", "local-lvm")
            .with_template("pve1", "9000", "debian-12", InstanceKind::Vm);
        if kind == BackendKind::Proxmox {
            backend.with_template(
                "pve1",
                "local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst",
                "debian-12-standard",
                InstanceKind::Container,
            )
        } else {
            backend
        }
    }

    fn lock(&self) -> Result<RwLockWriteGuard<'_, MockState>> {
        self.state
            .write()
            .map_err(|_| HypervisorError::Operation("Lock poisoned".to_string()))
    }

    fn with_state<F>(self, f: F) -> Self
    where
        F: FnOnce(&mut MockState),
    {
        if let Ok(mut state) = self.state.write() {
            f(&mut state);
        }
        self
    }

    // =========================================================================
    // Topology builders
    // =========================================================================

    pub fn with_node(self, name: &str) -> Self {
        self.with_state(|s| {
            s.nodes.push(MockNode {
                name: name.to_string(),
                storages: Vec::new(),
                templates: Vec::new(),
            })
        })
    }

    pub fn with_storage(self, node: &str, storage: &str) -> Self {
        self.with_state(|s| {
            if let Some(n) = s.nodes.iter_mut().find(|n| n.name == node) {
                n.storages.push(storage.to_string());
            }
        })
    }

    pub fn with_template(self, node: &str, reference: &str, name: &str, kind: InstanceKind) -> Self {
        self.with_state(|s| {
            if let Some(n) = s.nodes.iter_mut().find(|n| n.name == node) {
                n.templates.push(TemplateInfo {
                    id: reference.to_string(),
                    name: name.to_string(),
                    reference: reference.to_string(),
                    kind,
                });
            }
        })
    }

    /// Add a pre-existing instance.
    pub fn with_instance(self, node: &str, reference: &str, name: &str, status: PowerState, config: InstanceConfig) -> Self {
        self.with_state(|s| {
            s.instances.insert(
                reference.to_string(),
                MockInstance {
                    node: node.to_string(),
                    name: name.to_string(),
                    power: status,
                    config,
                    snapshots: Vec::new(),
                },
            );
        })
    }

    // =========================================================================
    // Runtime mutation and inspection
    // =========================================================================

    /// Remove a node and everything on it.
    pub fn remove_node(&self, name: &str) {
        if let Ok(mut s) = self.lock() {
            s.nodes.retain(|n| n.name != name);
            s.instances.retain(|_, i| i.node != name);
        }
    }

    /// Make every call of `operation` fail with `error` until cleared.
    pub fn fail_on(&self, operation: &'static str, error: HypervisorError) {
        if let Ok(mut s) = self.lock() {
            s.failures.insert(operation, error);
        }
    }

    pub fn clear_failure(&self, operation: &str) {
        if let Ok(mut s) = self.lock() {
            s.failures.remove(operation);
        }
    }

    /// Calls made so far, as `operation` or `operation:reference`.
    pub fn calls(&self) -> Vec<String> {
        self.state.read().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Number of instances currently present.
    pub fn instance_count(&self) -> usize {
        self.state.read().map(|s| s.instances.len()).unwrap_or(0)
    }

    /// Power state of an instance, if it exists.
    pub fn power_state(&self, reference: &str) -> Option<PowerState> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.instances.get(reference).map(|i| i.power))
    }

    /// Snapshot names of an instance.
    pub fn snapshots(&self, reference: &str) -> Vec<String> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.instances.get(reference).map(|i| i.snapshots.clone()))
            .unwrap_or_default()
    }

    /// Record the call and return the injected failure, if any.
    fn enter(&self, operation: &'static str, reference: Option<&str>) -> Result<RwLockWriteGuard<'_, MockState>> {
        let mut state = self.lock()?;
        state.calls.push(match reference {
            Some(r) => format!("{}:{}", operation, r),
            None => operation.to_string(),
        });
        if let Some(err) = state.failures.get(operation) {
            debug!(operation, error = %err, "Injected failure");
            return Err(err.clone());
        }
        Ok(state)
    }

    fn node_exists(state: &MockState, node: &str) -> Result<()> {
        if state.nodes.iter().any(|n| n.name == node) {
            Ok(())
        } else {
            Err(HypervisorError::NotFound(format!("node {} not found", node)))
        }
    }

    fn instance<'a>(&self, state: &'a mut MockState, node: &str, reference: &str) -> Result<&'a mut MockInstance> {
        let kind = self.kind;
        match state.instances.get_mut(reference) {
            // vCenter-style backends address by UUID alone
            Some(i) if kind == BackendKind::Vcenter || i.node == node => Ok(i),
            _ => Err(HypervisorError::NotFound(format!("instance {} not found on node {}", reference, node))),
        }
    }

    fn insert_created(&self, state: &mut MockState, request: &CreateRequest, kind: InstanceKind) -> Result<String> {
        Self::node_exists(state, &request.node)?;
        let template_known = state
            .nodes
            .iter()
            .flat_map(|n| n.templates.iter())
            .any(|t| t.reference == request.template_ref && t.kind == kind);
        if !template_known {
            return Err(HypervisorError::Operation(format!("template {} not found", request.template_ref)));
        }

        let reference = match (&request.id, self.kind) {
            (Some(id), _) => id.clone(),
            (None, BackendKind::Vcenter) => uuid::Uuid::new_v4().to_string(),
            (None, BackendKind::Proxmox) => {
                return Err(HypervisorError::Operation("a pre-assigned id is required".to_string()))
            }
        };
        if state.instances.contains_key(&reference) {
            return Err(HypervisorError::Operation(format!("instance {} already exists", reference)));
        }

        state.instances.insert(
            reference.clone(),
            MockInstance {
                node: request.node.clone(),
                name: request.name.clone(),
                power: PowerState::Running,
                config: InstanceConfig {
                    cores: request.cores,
                    memory_mib: request.memory_mib,
                    disk_gib: request.disk_gib,
                    kind,
                },
                snapshots: Vec::new(),
            },
        );
        Ok(reference)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(BackendKind::Proxmox)
    }
}

#[async_trait]
impl HypervisorClient for MockBackend {
    fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    async fn get_version(&self) -> Result<String> {
        let state = self.enter("get_version", None)?;
        Ok(state.version.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let state = self.enter("list_nodes", None)?;
        Ok(state
            .nodes
            .iter()
            .map(|n| NodeInfo {
                id: n.name.clone(),
                name: n.name.clone(),
            })
            .collect())
    }

    async fn list_storages(&self, node: &str) -> Result<Vec<StorageInfo>> {
        let state = self.enter("list_storages", Some(node))?;
        Ok(state
            .nodes
            .iter()
            .filter(|n| n.name == node)
            .flat_map(|n| n.storages.iter())
            .map(|s| StorageInfo {
                id: s.clone(),
                name: s.clone(),
            })
            .collect())
    }

    async fn list_templates(&self, node: &str) -> Result<Vec<TemplateInfo>> {
        let state = self.enter("list_templates", Some(node))?;
        Ok(state
            .nodes
            .iter()
            .filter(|n| n.name == node)
            .flat_map(|n| n.templates.iter().cloned())
            .collect())
    }

    async fn list_all_instances(&self, node: &str) -> Result<Vec<RemoteInstance>> {
        let state = self.enter("list_all_instances", Some(node))?;
        let mut instances: Vec<RemoteInstance> = state
            .instances
            .iter()
            .filter(|(_, i)| i.node == node)
            .map(|(reference, i)| RemoteInstance {
                reference: reference.clone(),
                name: i.name.clone(),
                status: match i.power {
                    PowerState::Running => "running",
                    PowerState::Stopped => "stopped",
                    PowerState::Suspended => "suspended",
                    PowerState::Unknown => "unknown",
                }
                .to_string(),
                kind: i.config.kind,
            })
            .collect();
        instances.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(instances)
    }

    async fn get_next_instance_id(&self) -> Result<Option<String>> {
        let mut state = self.enter("get_next_instance_id", None)?;
        if !self.kind.assigns_ids_before_create() {
            return Ok(None);
        }
        while state.instances.contains_key(&state.next_id.to_string()) {
            state.next_id += 1;
        }
        let id = state.next_id;
        state.next_id += 1;
        Ok(Some(id.to_string()))
    }

    #[instrument(skip(self, request), fields(node = %request.node, name = %request.name))]
    async fn create_vm(&self, request: &CreateRequest) -> Result<String> {
        let mut state = self.enter("create_vm", request.id.as_deref())?;
        let reference = self.insert_created(&mut state, request, InstanceKind::Vm)?;
        info!(reference = %reference, "Mock VM created");
        Ok(reference)
    }

    #[instrument(skip(self, request, root_password), fields(node = %request.node, name = %request.name))]
    async fn create_container(&self, request: &CreateRequest, root_password: &str) -> Result<String> {
        let mut state = self.enter("create_container", request.id.as_deref())?;
        if self.kind != BackendKind::Proxmox {
            return Err(HypervisorError::Unsupported(format!(
                "{} does not provision containers",
                self.kind.label()
            )));
        }
        if root_password.is_empty() {
            return Err(HypervisorError::Operation("root password required".to_string()));
        }
        let reference = self.insert_created(&mut state, request, InstanceKind::Container)?;
        info!(reference = %reference, "Mock container created");
        Ok(reference)
    }

    async fn delete_vm(&self, node: &str, reference: &str) -> Result<()> {
        let mut state = self.enter("delete_vm", Some(reference))?;
        self.instance(&mut state, node, reference)?;
        state.instances.remove(reference);
        Ok(())
    }

    async fn start(&self, node: &str, reference: &str) -> Result<()> {
        let mut state = self.enter("start", Some(reference))?;
        self.instance(&mut state, node, reference)?.power = PowerState::Running;
        Ok(())
    }

    async fn stop(&self, node: &str, reference: &str) -> Result<()> {
        let mut state = self.enter("stop", Some(reference))?;
        self.instance(&mut state, node, reference)?.power = PowerState::Stopped;
        Ok(())
    }

    async fn reboot(&self, node: &str, reference: &str) -> Result<()> {
        let mut state = self.enter("reboot", Some(reference))?;
        self.instance(&mut state, node, reference)?.power = PowerState::Running;
        Ok(())
    }

    async fn suspend(&self, node: &str, reference: &str) -> Result<()> {
        let mut state = self.enter("suspend", Some(reference))?;
        self.instance(&mut state, node, reference)?.power = PowerState::Suspended;
        Ok(())
    }

    async fn create_snapshot(&self, node: &str, reference: &str, snap_name: &str, _description: &str) -> Result<()> {
        let mut state = self.enter("create_snapshot", Some(reference))?;
        let instance = self.instance(&mut state, node, reference)?;
        if !instance.config.kind.supports_snapshots() {
            return Err(HypervisorError::Unsupported(format!(
                "snapshots are not supported for {} {}",
                instance.config.kind, reference
            )));
        }
        instance.snapshots.push(snap_name.to_string());
        Ok(())
    }

    async fn rollback_snapshot(&self, node: &str, reference: &str, snap_name: &str) -> Result<()> {
        let mut state = self.enter("rollback_snapshot", Some(reference))?;
        let instance = self.instance(&mut state, node, reference)?;
        if !instance.snapshots.iter().any(|s| s == snap_name) {
            return Err(HypervisorError::NotFound(format!("Snapshot '{}' not found", snap_name)));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, node: &str, reference: &str, snap_name: &str) -> Result<()> {
        let mut state = self.enter("delete_snapshot", Some(reference))?;
        let instance = self.instance(&mut state, node, reference)?;
        let before = instance.snapshots.len();
        instance.snapshots.retain(|s| s != snap_name);
        if instance.snapshots.len() == before {
            return Err(HypervisorError::NotFound(format!("Snapshot '{}' not found", snap_name)));
        }
        Ok(())
    }

    async fn get_console_url(&self, node: &str, reference: &str) -> Result<String> {
        let mut state = self.enter("get_console_url", Some(reference))?;
        self.instance(&mut state, node, reference)?;
        Ok(format!("https://mock.invalid/console?node={}&ref={}", node, reference))
    }

    async fn get_vm_config(&self, node: &str, reference: &str) -> Result<InstanceConfig> {
        let mut state = self.enter("get_vm_config", Some(reference))?;
        Ok(self.instance(&mut state, node, reference)?.config)
    }
}

// =============================================================================
// CONNECTOR
// =============================================================================

/// [`AdapterFactory`] handing out registered mock backends by host name.
///
/// Unknown hosts are refused with a connection error unless the connector
/// was built with [`MockConnector::seeded`], in which case a
/// [`MockBackend::demo`] is created for them on first connect.
#[derive(Default)]
pub struct MockConnector {
    backends: RwLock<HashMap<String, Arc<MockBackend>>>,
    seed_unknown: bool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that creates a demo backend for every unknown host.
    pub fn seeded() -> Self {
        Self {
            seed_unknown: true,
            ..Self::default()
        }
    }

    /// Serve `backend` for connections to `host`.
    pub fn register(&self, host: &str, backend: Arc<MockBackend>) {
        if let Ok(mut backends) = self.backends.write() {
            backends.insert(host.to_string(), backend);
        }
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdapterFactory for MockConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn HypervisorClient>> {
        let mut backends = self
            .backends
            .write()
            .map_err(|_| HypervisorError::Connection("Lock poisoned".to_string()))?;

        let backend = match backends.get(&settings.host) {
            Some(backend) => backend.clone(),
            None if self.seed_unknown => {
                let backend = Arc::new(MockBackend::demo(settings.kind));
                backends.insert(settings.host.clone(), backend.clone());
                backend
            }
            None => {
                return Err(HypervisorError::Connection(format!(
                    "Could not connect to {} host {}",
                    settings.kind.label(),
                    settings.host
                )))
            }
        };

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(backend)
    }
}
