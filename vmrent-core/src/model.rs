//! Records managed by the rental core.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use vmrent_hypervisor::{ConnectionSettings, InstanceKind};

use crate::error::{RentalError, Result};
use crate::resources::ResourceSpec;

// =============================================================================
// INVENTORY
// =============================================================================

/// Last known result of talking to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Untested,
    Connecting,
    Connected,
    Failed,
}

/// A configured backend connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorServer {
    pub id: Uuid,
    pub name: String,
    pub connection: ConnectionSettings,
    pub status: ConnectionStatus,
    pub status_message: String,
}

impl HypervisorServer {
    pub fn new(name: impl Into<String>, connection: ConnectionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            connection,
            status: ConnectionStatus::Untested,
            status_message: String::new(),
        }
    }
}

/// A compute node or cluster of a server. Name is unique per server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
}

impl Node {
    pub fn new(server_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            name: name.into(),
        }
    }
}

/// Pricing metadata carried for the pricing collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePricing {
    pub storage_type: String,
    pub price_per_gb: f64,
    pub iops_tier: Option<String>,
}

/// A datastore or pool of a server, visible on a set of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub node_ids: BTreeSet<Uuid>,
    pub pricing: Option<StoragePricing>,
}

impl Storage {
    pub fn new(server_id: Uuid, name: impl Into<String>, node_ids: BTreeSet<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            name: name.into(),
            node_ids,
            pricing: None,
        }
    }
}

/// A clonable image or container seed. `reference` is unique per server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub reference: String,
    pub kind: InstanceKind,
}

impl Template {
    pub fn new(server_id: Uuid, name: impl Into<String>, reference: impl Into<String>, kind: InstanceKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            name: name.into(),
            reference: reference.into(),
            kind,
        }
    }
}

// =============================================================================
// INSTANCES
// =============================================================================

/// Lifecycle state of a rented instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Pending,
    Active,
    Stopped,
    Suspended,
    Terminated,
    Archived,
    Failed,
}

impl VmState {
    /// Terminated and archived instances no longer count as rented.
    pub fn is_closed(&self) -> bool {
        matches!(self, VmState::Terminated | VmState::Archived)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmState::Pending => "pending",
            VmState::Active => "active",
            VmState::Stopped => "stopped",
            VmState::Suspended => "suspended",
            VmState::Terminated => "terminated",
            VmState::Archived => "archived",
            VmState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Where a provisioned instance lives on its backend.
///
/// Reference and node only exist together; an instance without a placement
/// has never been provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPlacement {
    pub reference: String,
    pub node: String,
}

/// A rented VM or container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInstance {
    pub id: Uuid,
    pub name: String,
    pub customer_id: Uuid,
    pub server_id: Uuid,
    pub node_id: Option<Uuid>,
    pub storage_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub kind: InstanceKind,
    pub resources: ResourceSpec,
    pub trial: bool,
    pub state: VmState,
    pub backend: Option<BackendPlacement>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Error of the last failed provisioning attempt
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VmInstance {
    /// A new, unplaced instance in `pending`.
    pub fn new(name: impl Into<String>, customer_id: Uuid, server_id: Uuid, resources: ResourceSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            customer_id,
            server_id,
            node_id: None,
            storage_id: None,
            template_id: None,
            kind: InstanceKind::Vm,
            resources,
            trial: false,
            state: VmState::Pending,
            backend: None,
            start_date: None,
            end_date: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Select node, storage and template for provisioning.
    pub fn with_placement(mut self, node: &Node, storage: &Storage, template: &Template) -> Self {
        self.node_id = Some(node.id);
        self.storage_id = Some(storage.id);
        self.template_id = Some(template.id);
        self.kind = template.kind;
        self
    }

    pub fn with_trial(mut self, trial: bool) -> Self {
        self.trial = trial;
        self
    }

    pub fn is_provisioned(&self) -> bool {
        self.backend.is_some()
    }

    /// End date must not precede start date.
    pub fn check_dates(&self) -> Result<()> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) if end < start => Err(RentalError::Validation(
                "End date cannot be before start date".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether the rental window closed before `today`.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.end_date.is_some_and(|end| end < today)
    }
}

/// A named point-in-time marker of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Name on the backend
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// CONFIG BACKUPS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    /// Taken by the scheduled backup sweep; pruned by retention
    Auto,
    /// Taken before a critical-field write
    PreChange,
}

/// Resource and placement fields captured by a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub name: String,
    pub server_id: Uuid,
    pub node_id: Option<Uuid>,
    pub storage_id: Option<Uuid>,
    pub template_id: Option<Uuid>,
    pub cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    pub customer_id: Uuid,
    pub state: VmState,
    pub end_date: Option<NaiveDate>,
}

impl From<&VmInstance> for BackupPayload {
    fn from(vm: &VmInstance) -> Self {
        Self {
            name: vm.name.clone(),
            server_id: vm.server_id,
            node_id: vm.node_id,
            storage_id: vm.storage_id,
            template_id: vm.template_id,
            cores: vm.resources.cores,
            memory_mib: vm.resources.memory_mib,
            disk_gib: vm.resources.disk_gib,
            customer_id: vm.customer_id,
            state: vm.state,
            end_date: vm.end_date,
        }
    }
}

/// Serialized copy of an instance's resource and placement fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBackup {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub name: String,
    pub kind: BackupKind,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ConfigBackup {
    /// Capture `vm` now.
    pub fn capture(vm: &VmInstance, kind: BackupKind, name: Option<String>) -> Result<Self> {
        let now = Utc::now();
        let data = serde_json::to_value(BackupPayload::from(vm))
            .map_err(|e| RentalError::Repository(format!("cannot serialize backup: {}", e)))?;
        Ok(Self {
            id: Uuid::new_v4(),
            instance_id: vm.id,
            name: name.unwrap_or_else(|| format!("Backup {} - {}", vm.name, now.format("%Y-%m-%d %H:%M:%S"))),
            kind,
            data,
            created_at: now,
        })
    }

    pub fn payload(&self) -> Result<BackupPayload> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| RentalError::Validation(format!("backup {} is unreadable: {}", self.id, e)))
    }
}

// =============================================================================
// LINKING
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkingState {
    Draft,
    Fetched,
    Done,
}

/// One remote instance staged for import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkingLine {
    pub name: String,
    pub reference: String,
    pub node: String,
    pub status: String,
    pub kind: InstanceKind,
    /// Operator selection
    pub selected: bool,
}

/// Import of pre-existing remote instances of one server for one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkingJob {
    pub id: Uuid,
    pub server_id: Uuid,
    pub customer_id: Uuid,
    pub state: LinkingState,
    pub lines: Vec<LinkingLine>,
}

impl LinkingJob {
    pub fn new(server_id: Uuid, customer_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            customer_id,
            state: LinkingState::Draft,
            lines: Vec::new(),
        }
    }

    /// Mark the lines whose reference is in `references` as selected.
    pub fn select(&mut self, references: &[&str]) {
        for line in &mut self.lines {
            line.selected = references.contains(&line.reference.as_str());
        }
    }
}
