//! Type definitions shared by every backend adapter.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// BACKEND SELECTION
// =============================================================================

/// Which remote API a server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Node/VMID addressed REST API (Proxmox VE style)
    Proxmox,
    /// UUID/managed-object addressed API (vCenter style)
    Vcenter,
}

impl BackendKind {
    /// Human readable product label.
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::Proxmox => "Proxmox VE",
            BackendKind::Vcenter => "VMware vCenter",
        }
    }

    /// Whether the backend hands out instance ids before creation.
    pub fn assigns_ids_before_create(&self) -> bool {
        matches!(self, BackendKind::Proxmox)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Proxmox => write!(f, "proxmox"),
            BackendKind::Vcenter => write!(f, "vcenter"),
        }
    }
}

/// Credentials for a backend connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Proxmox API token (`user!token_name=token_value`)
    ApiToken {
        user: String,
        token_name: String,
        token_value: String,
    },
    /// Username and password (vCenter SSO)
    Password { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiToken { user, token_name, .. } => f
                .debug_struct("ApiToken")
                .field("user", user)
                .field("token_name", token_name)
                .field("token_value", &"<redacted>")
                .finish(),
            Credentials::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything an adapter needs to open a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Backend API flavour
    pub kind: BackendKind,
    /// Hostname or IP address
    pub host: String,
    /// Port override (Proxmox default 8006, vCenter default 443)
    #[serde(default)]
    pub port: Option<u16>,
    /// Authentication material
    pub credentials: Credentials,
    /// Verify the backend's TLS certificate
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_verify_tls() -> bool {
    true
}

impl ConnectionSettings {
    /// Port to use, falling back to the backend's default.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.kind {
            BackendKind::Proxmox => 8006,
            BackendKind::Vcenter => 443,
        })
    }
}

// =============================================================================
// INVENTORY
// =============================================================================

/// Type of a template or instance. Decides the provisioning method and
/// which endpoints apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    /// Full virtual machine (clone-style provisioning)
    Vm,
    /// Container (template-file provisioning)
    Container,
}

impl InstanceKind {
    /// Only full VMs support snapshots.
    pub fn supports_snapshots(&self) -> bool {
        matches!(self, InstanceKind::Vm)
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Vm => write!(f, "vm"),
            InstanceKind::Container => write!(f, "container"),
        }
    }
}

/// A compute node or cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
}

/// A storage pool or datastore visible on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub id: String,
    pub name: String,
}

/// A clonable image or container seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub id: String,
    /// Display name
    pub name: String,
    /// Backend reference used to provision from this template
    /// (VMID, volume id, or instance UUID)
    pub reference: String,
    pub kind: InstanceKind,
}

/// Power state as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Suspended,
    Unknown,
}

impl PowerState {
    /// Normalise a backend status string ("running", "poweredOn", ...).
    pub fn from_backend(status: &str) -> Self {
        match status {
            "running" | "poweredOn" | "POWERED_ON" => PowerState::Running,
            "stopped" | "poweredOff" | "POWERED_OFF" => PowerState::Stopped,
            "suspended" | "paused" | "SUSPENDED" => PowerState::Suspended,
            _ => PowerState::Unknown,
        }
    }
}

/// An instance found on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInstance {
    /// Backend reference (VMID or instance UUID)
    pub reference: String,
    pub name: String,
    /// Status string exactly as the backend reported it
    pub status: String,
    pub kind: InstanceKind,
}

impl RemoteInstance {
    /// Normalised power state.
    pub fn power_state(&self) -> PowerState {
        PowerState::from_backend(&self.status)
    }
}

/// Resource configuration read back from a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    pub kind: InstanceKind,
}

// =============================================================================
// PROVISIONING
// =============================================================================

/// Parameters shared by VM and container creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Node or cluster to place the instance on
    pub node: String,
    /// Pre-assigned id; `None` when the backend assigns it during creation
    pub id: Option<String>,
    pub name: String,
    /// Template reference (VMID/UUID for VMs, volume id for containers)
    pub template_ref: String,
    pub cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    /// Storage/datastore for the new disks
    pub storage: String,
}

impl CreateRequest {
    /// Create a request with the given placement and default resources.
    pub fn new(
        node: impl Into<String>,
        name: impl Into<String>,
        template_ref: impl Into<String>,
        storage: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            id: None,
            name: name.into(),
            template_ref: template_ref.into(),
            cores: 1,
            memory_mib: 1024,
            disk_gib: 10,
            storage: storage.into(),
        }
    }

    /// Set the pre-assigned instance id.
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Set CPU, memory (MiB) and disk (GiB).
    pub fn with_resources(mut self, cores: u32, memory_mib: u64, disk_gib: u64) -> Self {
        self.cores = cores;
        self.memory_mib = memory_mib;
        self.disk_gib = disk_gib;
        self
    }
}
