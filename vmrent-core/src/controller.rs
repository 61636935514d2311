//! VM lifecycle controller.
//!
//! Owns every state transition of a [`VmInstance`] and its side effects on
//! the backend:
//!
//! ```text
//! pending ──provision──▶ active ◀──▶ stopped / suspended
//!    │                     │
//!    ▼                     ▼
//! failed ──retry──▶ pending   terminate ──▶ terminated ──archive──▶ archived
//! ```
//!
//! Every operation reports itself to the [`AuditSink`] with its outcome and
//! duration. Backend calls are never made while holding a lock; a per
//! instance in-flight claim rejects a second lifecycle operation on the same
//! instance while one is running.

use chrono::{Days, Months, NaiveDate, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use vmrent_common::TimedOperation;
use vmrent_hypervisor::{AdapterCache, ConnectionSettings, CreateRequest, HypervisorClient, HypervisorError, InstanceKind};

use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::error::{RentalError, Result};
use crate::model::*;
use crate::repository::RentalRepository;
use crate::resources::{ResourcePreset, ResourceSpec};
use crate::settings::RentalSettings;
use crate::sweeps::BatchReport;
use crate::sync::{record_server_status, InventorySynchronizer, SyncReport};

/// Length of generated container root passwords
const ROOT_PASSWORD_LEN: usize = 16;

/// Result of a successful provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionOutcome {
    pub reference: String,
    pub node: String,
    /// Root password of a new container. Handed out once and never stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
}

/// Power operations delegated to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Suspend,
    Reboot,
}

impl PowerAction {
    fn audit_action(&self) -> AuditAction {
        match self {
            PowerAction::Start => AuditAction::Start,
            PowerAction::Stop => AuditAction::Stop,
            PowerAction::Suspend => AuditAction::Suspend,
            PowerAction::Reboot => AuditAction::Reboot,
        }
    }

    /// Local state after success; reboot leaves the state alone.
    fn resulting_state(&self) -> Option<VmState> {
        match self {
            PowerAction::Start => Some(VmState::Active),
            PowerAction::Stop => Some(VmState::Stopped),
            PowerAction::Suspend => Some(VmState::Suspended),
            PowerAction::Reboot => None,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.audit_action())
    }
}

/// Releases an in-flight claim when dropped.
pub(crate) struct InFlightGuard<'a> {
    claims: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.id);
        }
    }
}

/// Lifecycle controller over a repository, an adapter cache and an audit
/// sink.
pub struct VmController {
    repo: Arc<dyn RentalRepository>,
    adapters: Arc<AdapterCache>,
    audit: Arc<dyn AuditSink>,
    settings: RentalSettings,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl VmController {
    pub fn new(
        repo: Arc<dyn RentalRepository>,
        adapters: Arc<AdapterCache>,
        audit: Arc<dyn AuditSink>,
        settings: RentalSettings,
    ) -> Self {
        Self {
            repo,
            adapters,
            audit,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn settings(&self) -> &RentalSettings {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<dyn RentalRepository> {
        &self.repo
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) fn claim(&self, id: Uuid) -> Result<InFlightGuard<'_>> {
        let mut claims = self
            .in_flight
            .lock()
            .map_err(|_| RentalError::Repository("Lock poisoned".to_string()))?;
        if !claims.insert(id) {
            return Err(RentalError::InvalidState(format!(
                "another operation on instance {} is in progress",
                id
            )));
        }
        Ok(InFlightGuard {
            claims: &self.in_flight,
            id,
        })
    }

    pub(crate) async fn record<T: Sync>(
        &self,
        id: Uuid,
        action: AuditAction,
        timer: &TimedOperation,
        result: &Result<T>,
        metadata: serde_json::Value,
    ) {
        let mut event = AuditEvent::new(id, action, timer.elapsed_secs()).with_metadata(metadata);
        if let Err(e) = result {
            event = event.failed(e.to_string());
        }
        self.audit.record(event).await;
    }

    /// Load an instance or fail with not-found.
    pub async fn instance(&self, id: Uuid) -> Result<VmInstance> {
        self.repo
            .get_instance(id)
            .await?
            .ok_or_else(|| RentalError::not_found("VM instance", id))
    }

    async fn server(&self, id: Uuid) -> Result<HypervisorServer> {
        self.repo
            .get_server(id)
            .await?
            .ok_or_else(|| RentalError::not_found("Hypervisor server", id))
    }

    /// Connected adapter of a server, from the cache when possible.
    pub async fn adapter_for(&self, server_id: Uuid) -> Result<Arc<dyn HypervisorClient>> {
        let server = self.server(server_id).await?;
        Ok(self.adapters.get_or_connect(server.id, &server.connection).await?)
    }

    fn ensure_open(vm: &VmInstance) -> Result<()> {
        if vm.state.is_closed() {
            return Err(RentalError::InvalidState(format!("VM {} is {}", vm.name, vm.state)));
        }
        Ok(())
    }

    fn placement(vm: &VmInstance) -> Result<BackendPlacement> {
        vm.backend
            .clone()
            .ok_or_else(|| RentalError::InvalidState(format!("VM {} has not been provisioned", vm.name)))
    }

    fn ensure_snapshots_supported(vm: &VmInstance) -> Result<()> {
        if !vm.kind.supports_snapshots() {
            return Err(HypervisorError::Unsupported(format!("snapshots are not supported for {} instances", vm.kind)).into());
        }
        Ok(())
    }

    fn rental_end(&self, today: NaiveDate, trial: bool) -> Result<NaiveDate> {
        let end = if trial {
            today.checked_add_days(Days::new(u64::from(self.settings.trial_days)))
        } else {
            today.checked_add_months(Months::new(self.settings.rental_months))
        };
        end.ok_or_else(|| RentalError::Validation("rental end date out of range".to_string()))
    }

    /// Check that node and storage belong to `server_id` and the storage is
    /// visible on the node.
    async fn check_placement(&self, server_id: Uuid, node_id: Uuid, storage_id: Uuid) -> Result<(Node, Storage)> {
        let node = self
            .repo
            .get_node(node_id)
            .await?
            .ok_or_else(|| RentalError::not_found("Node", node_id))?;
        let storage = self
            .repo
            .get_storage(storage_id)
            .await?
            .ok_or_else(|| RentalError::not_found("Storage", storage_id))?;
        if node.server_id != server_id || storage.server_id != server_id {
            return Err(RentalError::Validation(
                "Node and storage must belong to the instance's server".to_string(),
            ));
        }
        if !storage.node_ids.contains(&node.id) {
            return Err(RentalError::Validation(format!(
                "Storage {} is not available on node {}",
                storage.name, node.name
            )));
        }
        Ok((node, storage))
    }

    // =========================================================================
    // Servers
    // =========================================================================

    /// Store a new server configuration.
    pub async fn register_server(&self, name: &str, connection: ConnectionSettings) -> Result<HypervisorServer> {
        let server = HypervisorServer::new(name, connection);
        self.repo.save_server(&server).await?;
        info!(server_id = %server.id, server = %server.name, kind = %server.connection.kind, "Registered hypervisor server");
        Ok(server)
    }

    /// Replace the connection settings of a server and drop its cached
    /// adapter.
    #[instrument(skip(self, connection), fields(server_id = %server_id))]
    pub async fn update_server_connection(&self, server_id: Uuid, connection: ConnectionSettings) -> Result<HypervisorServer> {
        let mut server = self.server(server_id).await?;
        server.connection = connection;
        server.status = ConnectionStatus::Untested;
        server.status_message.clear();
        self.repo.save_server(&server).await?;
        self.adapters.invalidate(server_id).await;
        info!("Connection settings updated");
        Ok(server)
    }

    /// Connect to a server and reconcile its inventory.
    ///
    /// A server not yet connected is marked `connecting` for the duration.
    #[instrument(skip(self), fields(server_id = %server_id))]
    pub async fn test_connection(&self, server_id: Uuid) -> Result<SyncReport> {
        let server = self.server(server_id).await?;
        if server.status != ConnectionStatus::Connected {
            let message = format!("Connecting to {}", server.connection.host);
            record_server_status(self.repo.as_ref(), &server, ConnectionStatus::Connecting, message).await?;
        }
        let adapter = match self.adapters.get_or_connect(server.id, &server.connection).await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(error = %e, "Connection test failed");
                record_server_status(self.repo.as_ref(), &server, ConnectionStatus::Failed, e.to_string()).await?;
                return Err(e.into());
            }
        };
        InventorySynchronizer::new(self.repo.clone())
            .sync(&server, adapter.as_ref())
            .await
    }

    /// Ask a server for its version and record the outcome.
    pub async fn check_health(&self, server_id: Uuid) -> Result<String> {
        let server = self.server(server_id).await?;
        let probe = async {
            let adapter = self.adapters.get_or_connect(server.id, &server.connection).await?;
            adapter.get_version().await
        };
        match probe.await {
            Ok(version) => {
                let message = format!("Connected to {}", version);
                record_server_status(self.repo.as_ref(), &server, ConnectionStatus::Connected, message).await?;
                Ok(version)
            }
            Err(e) => {
                if e.is_connection() {
                    self.adapters.invalidate(server.id).await;
                }
                record_server_status(self.repo.as_ref(), &server, ConnectionStatus::Failed, e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Instance records
    // =========================================================================

    /// Validate and store a new `pending` instance.
    pub async fn create_instance(&self, vm: VmInstance) -> Result<VmInstance> {
        if vm.state != VmState::Pending {
            return Err(RentalError::InvalidState("new instances start pending".to_string()));
        }
        self.settings.limits.validate(&vm.resources)?;
        vm.check_dates()?;
        if let (Some(node_id), Some(storage_id)) = (vm.node_id, vm.storage_id) {
            self.check_placement(vm.server_id, node_id, storage_id).await?;
        }
        self.repo.save_instance(&vm).await?;
        info!(vm_id = %vm.id, name = %vm.name, customer_id = %vm.customer_id, "Instance created");
        Ok(vm)
    }

    /// Instances of a customer that still count as rented.
    pub async fn count_active_for_customer(&self, customer_id: Uuid) -> Result<usize> {
        Ok(self
            .repo
            .list_instances()
            .await?
            .iter()
            .filter(|vm| vm.customer_id == customer_id && !vm.state.is_closed())
            .count())
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Create a `pending` instance on its backend.
    ///
    /// On any backend failure the instance moves to `failed` with the error
    /// recorded and the error is returned; nothing is retried.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn provision(&self, id: Uuid) -> Result<ProvisionOutcome> {
        let timer = TimedOperation::start("provision");
        let result = async {
            let _claim = self.claim(id)?;
            let vm = self.instance(id).await?;
            self.provision_claimed(vm).await
        }
        .await;
        let metadata = match &result {
            Ok(outcome) => json!({"reference": outcome.reference, "node": outcome.node}),
            Err(_) => json!({}),
        };
        self.record(id, AuditAction::Provision, &timer, &result, metadata).await;
        result
    }

    /// Move a `failed` instance back to `pending` and provision it again.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn retry_provisioning(&self, id: Uuid) -> Result<ProvisionOutcome> {
        let timer = TimedOperation::start("retry_provisioning");
        let result = async {
            let _claim = self.claim(id)?;
            let mut vm = self.instance(id).await?;
            if vm.state != VmState::Failed {
                return Err(RentalError::InvalidState(format!(
                    "only failed instances can be retried, {} is {}",
                    vm.name, vm.state
                )));
            }
            vm.state = VmState::Pending;
            self.repo.save_instance(&vm).await?;
            info!("Retrying provisioning");
            self.provision_claimed(vm).await
        }
        .await;
        self.record(id, AuditAction::RetryProvisioning, &timer, &result, json!({})).await;
        result
    }

    async fn provision_claimed(&self, mut vm: VmInstance) -> Result<ProvisionOutcome> {
        if vm.state != VmState::Pending {
            return Err(RentalError::InvalidState(format!(
                "only pending instances can be provisioned, {} is {}",
                vm.name, vm.state
            )));
        }
        let (Some(node_id), Some(storage_id), Some(template_id)) = (vm.node_id, vm.storage_id, vm.template_id) else {
            return Err(RentalError::Validation(
                "Please select a node, storage and template before provisioning".to_string(),
            ));
        };
        self.settings.limits.validate(&vm.resources)?;
        let (node, storage) = self.check_placement(vm.server_id, node_id, storage_id).await?;
        let template = self
            .repo
            .get_template(template_id)
            .await?
            .ok_or_else(|| RentalError::not_found("Template", template_id))?;
        let today = Utc::now().date_naive();
        let end_date = self.rental_end(today, vm.trial)?;

        match self.create_on_backend(&vm, &node, &storage, &template).await {
            Ok((reference, root_password)) => {
                vm.backend = Some(BackendPlacement {
                    reference: reference.clone(),
                    node: node.name.clone(),
                });
                vm.kind = template.kind;
                vm.state = VmState::Active;
                vm.start_date = Some(today);
                vm.end_date = Some(end_date);
                vm.last_error = None;
                self.repo.save_instance(&vm).await?;
                info!(reference = %reference, node = %node.name, end_date = %end_date, "Instance provisioned");
                Ok(ProvisionOutcome {
                    reference,
                    node: node.name,
                    root_password,
                })
            }
            Err(e) => {
                error!(error = %e, "Provisioning failed");
                vm.state = VmState::Failed;
                vm.last_error = Some(e.to_string());
                self.repo.save_instance(&vm).await?;
                Err(e)
            }
        }
    }

    /// Returns the backend reference and, for containers, the root password.
    async fn create_on_backend(
        &self,
        vm: &VmInstance,
        node: &Node,
        storage: &Storage,
        template: &Template,
    ) -> Result<(String, Option<String>)> {
        let adapter = self.adapter_for(vm.server_id).await?;
        let id = adapter.get_next_instance_id().await?;
        if id.is_none() && adapter.backend_kind().assigns_ids_before_create() {
            return Err(HypervisorError::Operation(
                "could not fetch the next available id from the hypervisor".to_string(),
            )
            .into());
        }

        let request = CreateRequest::new(&node.name, &vm.name, &template.reference, &storage.name)
            .with_id(id)
            .with_resources(vm.resources.cores, vm.resources.memory_mib, vm.resources.disk_gib);

        match template.kind {
            InstanceKind::Vm => Ok((adapter.create_vm(&request).await?, None)),
            InstanceKind::Container => {
                let password = generate_root_password();
                let reference = adapter.create_container(&request, &password).await?;
                Ok((reference, Some(password)))
            }
        }
    }

    // =========================================================================
    // Power
    // =========================================================================

    pub async fn start(&self, id: Uuid) -> Result<VmInstance> {
        self.power(id, PowerAction::Start).await
    }

    pub async fn stop(&self, id: Uuid) -> Result<VmInstance> {
        self.power(id, PowerAction::Stop).await
    }

    pub async fn suspend(&self, id: Uuid) -> Result<VmInstance> {
        self.power(id, PowerAction::Suspend).await
    }

    pub async fn reboot(&self, id: Uuid) -> Result<VmInstance> {
        self.power(id, PowerAction::Reboot).await
    }

    /// Run a power action on the backend and mirror it locally.
    #[instrument(skip(self), fields(vm_id = %id, action = %action))]
    pub async fn power(&self, id: Uuid, action: PowerAction) -> Result<VmInstance> {
        let timer = TimedOperation::start(action.to_string());
        let result = async {
            let _claim = self.claim(id)?;
            let mut vm = self.instance(id).await?;
            Self::ensure_open(&vm)?;
            let placement = Self::placement(&vm)?;
            let adapter = self.adapter_for(vm.server_id).await?;
            let (node, reference) = (placement.node.as_str(), placement.reference.as_str());
            match action {
                PowerAction::Start => adapter.start(node, reference).await?,
                PowerAction::Stop => adapter.stop(node, reference).await?,
                PowerAction::Suspend => adapter.suspend(node, reference).await?,
                PowerAction::Reboot => adapter.reboot(node, reference).await?,
            }
            if let Some(state) = action.resulting_state() {
                vm.state = state;
                self.repo.save_instance(&vm).await?;
            }
            info!(state = %vm.state, "Power action completed");
            Ok(vm)
        }
        .await;
        self.record(id, action.audit_action(), &timer, &result, json!({})).await;
        result
    }

    // =========================================================================
    // Rental period
    // =========================================================================

    /// Extend the rental by `months`, counted from the later of the current
    /// end date and today.
    ///
    /// A suspended instance is started again; a failed restart is logged and
    /// does not fail the extension.
    #[instrument(skip(self), fields(vm_id = %id, months = months))]
    pub async fn extend(&self, id: Uuid, months: u32) -> Result<VmInstance> {
        let timer = TimedOperation::start("extend");
        let result = async {
            if months == 0 {
                return Err(RentalError::Validation("Invalid extension period".to_string()));
            }
            let _claim = self.claim(id)?;
            let mut vm = self.instance(id).await?;
            Self::ensure_open(&vm)?;

            let today = Utc::now().date_naive();
            let base = vm.end_date.filter(|end| *end > today).unwrap_or(today);
            let end = base
                .checked_add_months(Months::new(months))
                .ok_or_else(|| RentalError::Validation("rental end date out of range".to_string()))?;
            vm.end_date = Some(end);
            vm.check_dates()?;
            self.repo.save_instance(&vm).await?;

            if vm.state == VmState::Suspended {
                if let Some(placement) = vm.backend.clone() {
                    let restart = async {
                        let adapter = self.adapter_for(vm.server_id).await?;
                        adapter.start(&placement.node, &placement.reference).await?;
                        Ok::<_, RentalError>(())
                    };
                    match restart.await {
                        Ok(()) => {
                            vm.state = VmState::Active;
                            self.repo.save_instance(&vm).await?;
                        }
                        Err(e) => warn!(error = %e, "Failed to start instance after extension"),
                    }
                }
            }
            info!(end_date = %end, state = %vm.state, "Rental extended");
            Ok(vm)
        }
        .await;
        let metadata = match &result {
            Ok(vm) => json!({"months": months, "end_date": vm.end_date}),
            Err(_) => json!({"months": months}),
        };
        self.record(id, AuditAction::Extend, &timer, &result, metadata).await;
        result
    }

    /// Extend several instances; one failure does not stop the others.
    pub async fn extend_many(&self, ids: &[Uuid], months: u32) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            let outcome = self.extend(*id, months).await.map(|_| ());
            report.push(*id, outcome);
        }
        report
    }

    // =========================================================================
    // End of life
    // =========================================================================

    /// Delete the backend instance, if any, and close the record.
    ///
    /// Backend errors are logged and swallowed. Terminating a closed
    /// instance is rejected.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn terminate(&self, id: Uuid) -> Result<VmInstance> {
        let timer = TimedOperation::start("terminate");
        let result = async {
            let _claim = self.claim(id)?;
            let mut vm = self.instance(id).await?;
            if vm.state.is_closed() {
                return Err(RentalError::InvalidState(format!("VM {} is already {}", vm.name, vm.state)));
            }

            if let Some(placement) = vm.backend.clone() {
                let delete = async {
                    let adapter = self.adapter_for(vm.server_id).await?;
                    adapter.delete_vm(&placement.node, &placement.reference).await?;
                    Ok::<_, RentalError>(())
                };
                if let Err(e) = delete.await {
                    warn!(reference = %placement.reference, error = %e, "Backend deletion failed, closing record anyway");
                }
            }

            vm.state = VmState::Terminated;
            self.repo.save_instance(&vm).await?;
            info!("Instance terminated");
            Ok(vm)
        }
        .await;
        self.record(id, AuditAction::Terminate, &timer, &result, json!({})).await;
        result
    }

    /// Move a terminated instance to `archived`.
    pub async fn archive(&self, id: Uuid) -> Result<VmInstance> {
        let timer = TimedOperation::start("archive");
        let result = async {
            let _claim = self.claim(id)?;
            let mut vm = self.instance(id).await?;
            if vm.state != VmState::Terminated {
                return Err(RentalError::InvalidState(format!(
                    "only terminated instances can be archived, {} is {}",
                    vm.name, vm.state
                )));
            }
            vm.state = VmState::Archived;
            self.repo.save_instance(&vm).await?;
            Ok(vm)
        }
        .await;
        self.record(id, AuditAction::Archive, &timer, &result, json!({})).await;
        result
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot an active or stopped instance. An empty name is replaced by a
    /// timestamped one.
    #[instrument(skip(self, description), fields(vm_id = %id))]
    pub async fn create_snapshot(&self, id: Uuid, name: &str, description: &str) -> Result<Snapshot> {
        let timer = TimedOperation::start("create_snapshot");
        let name = if name.trim().is_empty() {
            format!("snap-{}", Utc::now().format("%Y%m%d-%H%M%S"))
        } else {
            name.trim().to_string()
        };
        let result = async {
            let _claim = self.claim(id)?;
            let vm = self.instance(id).await?;
            Self::ensure_snapshots_supported(&vm)?;
            if !matches!(vm.state, VmState::Active | VmState::Stopped) {
                return Err(RentalError::InvalidState(format!(
                    "snapshots can only be taken of active or stopped instances, {} is {}",
                    vm.name, vm.state
                )));
            }
            validate_snapshot_name(&name)?;
            if self.repo.find_snapshot(id, &name).await?.is_some() {
                return Err(RentalError::Validation(format!("Snapshot '{}' already exists", name)));
            }
            let placement = Self::placement(&vm)?;

            let adapter = self.adapter_for(vm.server_id).await?;
            adapter
                .create_snapshot(&placement.node, &placement.reference, &name, description)
                .await?;

            let snapshot = Snapshot {
                id: Uuid::new_v4(),
                instance_id: vm.id,
                name: name.clone(),
                description: description.to_string(),
                created_at: Utc::now(),
            };
            self.repo.create_snapshot(snapshot.clone()).await?;
            info!(snapshot = %name, "Snapshot created");
            Ok(snapshot)
        }
        .await;
        self.record(id, AuditAction::CreateSnapshot, &timer, &result, json!({"snapshot": name}))
            .await;
        result
    }

    /// Roll an instance back to one of its recorded snapshots.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn rollback_snapshot(&self, id: Uuid, name: &str) -> Result<()> {
        let timer = TimedOperation::start("rollback_snapshot");
        let result = async {
            let _claim = self.claim(id)?;
            let vm = self.instance(id).await?;
            Self::ensure_snapshots_supported(&vm)?;
            self.known_snapshot(&vm, name).await?;
            let placement = Self::placement(&vm)?;

            let adapter = self.adapter_for(vm.server_id).await?;
            adapter
                .rollback_snapshot(&placement.node, &placement.reference, name)
                .await?;
            info!(snapshot = %name, "Rolled back to snapshot");
            Ok(())
        }
        .await;
        self.record(id, AuditAction::RollbackSnapshot, &timer, &result, json!({"snapshot": name}))
            .await;
        result
    }

    /// Delete a recorded snapshot on the backend and locally.
    ///
    /// A snapshot the backend no longer knows is still removed locally.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn delete_snapshot(&self, id: Uuid, name: &str) -> Result<()> {
        let timer = TimedOperation::start("delete_snapshot");
        let result = async {
            let _claim = self.claim(id)?;
            let vm = self.instance(id).await?;
            Self::ensure_snapshots_supported(&vm)?;
            let snapshot = self.known_snapshot(&vm, name).await?;
            let placement = Self::placement(&vm)?;

            let adapter = self.adapter_for(vm.server_id).await?;
            match adapter.delete_snapshot(&placement.node, &placement.reference, name).await {
                Ok(()) => {}
                Err(HypervisorError::NotFound(msg)) => {
                    warn!(snapshot = %name, error = %msg, "Snapshot already gone on backend");
                }
                Err(e) => return Err(e.into()),
            }
            self.repo.delete_snapshot(snapshot.id).await?;
            info!(snapshot = %name, "Snapshot deleted");
            Ok(())
        }
        .await;
        self.record(id, AuditAction::DeleteSnapshot, &timer, &result, json!({"snapshot": name}))
            .await;
        result
    }

    pub async fn list_snapshots(&self, id: Uuid) -> Result<Vec<Snapshot>> {
        self.repo.list_snapshots(id).await
    }

    async fn known_snapshot(&self, vm: &VmInstance, name: &str) -> Result<Snapshot> {
        self.repo
            .find_snapshot(vm.id, name)
            .await?
            .ok_or_else(|| RentalError::Validation(format!("Snapshot '{}' not found for {}", name, vm.name)))
    }

    // =========================================================================
    // Console
    // =========================================================================

    /// Console URL of a provisioned instance.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn console_url(&self, id: Uuid) -> Result<String> {
        let timer = TimedOperation::start("console");
        let result = async {
            let vm = self.instance(id).await?;
            Self::ensure_open(&vm)?;
            let placement = Self::placement(&vm)?;
            let adapter = self.adapter_for(vm.server_id).await?;
            Ok(adapter.get_console_url(&placement.node, &placement.reference).await?)
        }
        .await;
        self.record(id, AuditAction::Console, &timer, &result, json!({})).await;
        result
    }

    // =========================================================================
    // Critical-field writes and config backups
    // =========================================================================

    /// Validate `updated`, back up `previous`, then store `updated`.
    async fn write_critical(&self, previous: &VmInstance, updated: VmInstance) -> Result<VmInstance> {
        self.settings.limits.validate(&updated.resources)?;
        updated.check_dates()?;
        let backup = ConfigBackup::capture(previous, BackupKind::PreChange, None)?;
        self.repo.save_backup(backup).await?;
        self.repo.save_instance(&updated).await?;
        Ok(updated)
    }

    /// Change CPU, memory and disk of an instance record.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn update_resources(&self, id: Uuid, spec: ResourceSpec) -> Result<VmInstance> {
        let timer = TimedOperation::start("update_resources");
        let result = async {
            let _claim = self.claim(id)?;
            let vm = self.instance(id).await?;
            Self::ensure_open(&vm)?;
            let mut updated = vm.clone();
            updated.resources = spec;
            let updated = self.write_critical(&vm, updated).await?;
            info!(resources = %spec, "Resources updated");
            Ok(updated)
        }
        .await;
        let metadata = json!({"cores": spec.cores, "memory_mib": spec.memory_mib, "disk_gib": spec.disk_gib});
        self.record(id, AuditAction::UpdateResources, &timer, &result, metadata).await;
        result
    }

    /// Apply a predefined size to a pending instance.
    pub async fn apply_preset(&self, id: Uuid, preset: ResourcePreset) -> Result<VmInstance> {
        let vm = self.instance(id).await?;
        if vm.state != VmState::Pending {
            return Err(RentalError::InvalidState(
                "Can only change configuration for pending VMs".to_string(),
            ));
        }
        self.update_resources(id, preset.spec()).await
    }

    /// Snap the resources of a pending instance to standard sizes.
    pub async fn normalize_resources(&self, id: Uuid) -> Result<VmInstance> {
        let vm = self.instance(id).await?;
        if vm.state != VmState::Pending {
            return Err(RentalError::InvalidState(
                "Can only normalize resources for pending VMs".to_string(),
            ));
        }
        self.update_resources(id, vm.resources.normalized()).await
    }

    /// Choose another node and storage for an instance not yet provisioned.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn update_placement(&self, id: Uuid, node_id: Uuid, storage_id: Uuid) -> Result<VmInstance> {
        let timer = TimedOperation::start("update_placement");
        let result = async {
            let _claim = self.claim(id)?;
            let vm = self.instance(id).await?;
            Self::ensure_open(&vm)?;
            if vm.is_provisioned() {
                return Err(RentalError::InvalidState(format!(
                    "VM {} is already provisioned on its node",
                    vm.name
                )));
            }
            self.check_placement(vm.server_id, node_id, storage_id).await?;
            let mut updated = vm.clone();
            updated.node_id = Some(node_id);
            updated.storage_id = Some(storage_id);
            self.write_critical(&vm, updated).await
        }
        .await;
        self.record(
            id,
            AuditAction::UpdatePlacement,
            &timer,
            &result,
            json!({"node_id": node_id, "storage_id": storage_id}),
        )
        .await;
        result
    }

    /// Take a manual config backup.
    pub async fn create_config_backup(&self, id: Uuid, name: Option<String>) -> Result<ConfigBackup> {
        let vm = self.instance(id).await?;
        let backup = ConfigBackup::capture(&vm, BackupKind::Manual, name)?;
        self.repo.save_backup(backup.clone()).await?;
        info!(vm_id = %id, backup = %backup.name, "Config backup created");
        Ok(backup)
    }

    /// Take an automatic config backup, pruned later by age.
    pub async fn create_auto_backup(&self, id: Uuid) -> Result<ConfigBackup> {
        let vm = self.instance(id).await?;
        let backup = ConfigBackup::capture(&vm, BackupKind::Auto, None)?;
        self.repo.save_backup(backup.clone()).await?;
        Ok(backup)
    }

    pub async fn list_backups(&self, id: Uuid) -> Result<Vec<ConfigBackup>> {
        self.repo.list_backups(Some(id)).await
    }

    /// Restore cores, memory, disk and end date from a backup.
    #[instrument(skip(self), fields(backup_id = %backup_id))]
    pub async fn restore_config_backup(&self, backup_id: Uuid) -> Result<VmInstance> {
        let timer = TimedOperation::start("restore_backup");
        let backup = self
            .repo
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| RentalError::not_found("Config backup", backup_id))?;
        let id = backup.instance_id;
        let result = async {
            let payload = backup.payload()?;
            let _claim = self.claim(id)?;
            let vm = self.instance(id).await?;
            Self::ensure_open(&vm)?;
            let mut updated = vm.clone();
            updated.resources = ResourceSpec::new(payload.cores, payload.memory_mib, payload.disk_gib);
            updated.end_date = payload.end_date;
            let updated = self.write_critical(&vm, updated).await?;
            info!(vm_id = %id, backup = %backup.name, "Config backup restored");
            Ok(updated)
        }
        .await;
        self.record(id, AuditAction::RestoreBackup, &timer, &result, json!({"backup_id": backup_id}))
            .await;
        result
    }

    /// Delete automatic backups older than `days`. Returns how many were
    /// removed.
    pub async fn cleanup_old_backups(&self, days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let stale: Vec<Uuid> = self
            .repo
            .list_backups(None)
            .await?
            .into_iter()
            .filter(|b| b.kind == BackupKind::Auto && b.created_at < cutoff)
            .map(|b| b.id)
            .collect();
        if !stale.is_empty() {
            self.repo.delete_backups(&stale).await?;
            info!(count = stale.len(), days = days, "Old automatic backups removed");
        }
        Ok(stale.len())
    }
}

/// Random alphanumeric password for a new container.
fn generate_root_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ROOT_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Snapshot names start with a letter and use letters, digits, `-` and `_`.
fn validate_snapshot_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && name.len() <= 40;
    if !valid {
        return Err(RentalError::Validation(format!("Invalid snapshot name '{}'", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_password_shape() {
        let password = generate_root_password();
        assert_eq!(password.len(), ROOT_PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, generate_root_password());
    }

    #[test]
    fn test_snapshot_names() {
        assert!(validate_snapshot_name("before-upgrade").is_ok());
        assert!(validate_snapshot_name("snap_2024").is_ok());
        assert!(validate_snapshot_name("1st").is_err());
        assert!(validate_snapshot_name("with space").is_err());
        assert!(validate_snapshot_name("").is_err());
        assert!(validate_snapshot_name(&"a".repeat(41)).is_err());
    }

    #[test]
    fn test_power_action_states() {
        assert_eq!(PowerAction::Start.resulting_state(), Some(VmState::Active));
        assert_eq!(PowerAction::Stop.resulting_state(), Some(VmState::Stopped));
        assert_eq!(PowerAction::Suspend.resulting_state(), Some(VmState::Suspended));
        assert_eq!(PowerAction::Reboot.resulting_state(), None);
        assert_eq!(PowerAction::Reboot.to_string(), "reboot");
    }
}
