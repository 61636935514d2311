//! Client-library surface the vCenter adapter is written against.
//!
//! [`VsphereApi`] is deliberately close to the managed-object API: compute
//! resources, VMs by managed object id, and mutations that hand back a task.
//! The adapter layers addressing by instance UUID, task polling and the
//! power-state shortcuts on top.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransportError;
use crate::types::PowerState;

/// Result type of every [`VsphereApi`] call.
pub type ApiResult<T> = std::result::Result<T, TransportError>;

/// Product information of the connected server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AboutInfo {
    /// Full product name and version
    pub full_name: String,
    /// Server instance UUID, used as `serverGuid` in console URLs
    pub instance_uuid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeResourceKind {
    Cluster,
    /// Host that is not part of a cluster
    Host,
}

/// A cluster or standalone host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeResource {
    /// Managed object id (`domain-c8`, `host-12`)
    pub moid: String,
    pub name: String,
    pub kind: ComputeResourceKind,
}

/// Summary of one virtual machine or template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    pub moid: String,
    pub name: String,
    pub instance_uuid: String,
    /// Power state string as reported (`poweredOn`, `POWERED_OFF`, ...)
    pub power_state: String,
    pub template: bool,
}

impl VmSummary {
    pub fn power(&self) -> PowerState {
        PowerState::from_backend(&self.power_state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    /// Device key
    pub key: String,
    pub label: String,
    pub capacity_kib: u64,
}

/// CPU, memory and disks of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHardware {
    pub num_cpu: u32,
    pub memory_mib: u64,
    pub disks: Vec<VirtualDisk>,
}

/// Clone a template onto a compute resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneSpec {
    pub template_moid: String,
    pub name: String,
    pub target: ComputeResource,
    /// Datastore name
    pub datastore: String,
    pub power_on: bool,
}

/// New size of one existing disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskResize {
    pub key: String,
    pub capacity_kib: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigureSpec {
    pub num_cpu: u32,
    pub memory_mib: u64,
    pub disk: Option<DiskResize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    Off,
    Suspend,
    /// Hard reset
    Reset,
}

/// Outcome of a mutating call.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskHandle {
    /// Server-side task to poll
    Remote(String),
    /// The call completed synchronously with this result
    Done(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Node of a VM's snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<SnapshotNode>,
}

impl SnapshotNode {
    /// Depth-first search of a snapshot forest by name.
    pub fn find<'a>(roots: &'a [SnapshotNode], name: &str) -> Option<&'a SnapshotNode> {
        roots.iter().find_map(|node| {
            if node.name == name {
                Some(node)
            } else {
                Self::find(&node.children, name)
            }
        })
    }
}

/// WebMKS console ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleTicket {
    pub host: String,
    pub port: u16,
    pub ticket: String,
}

/// Operations the vCenter adapter needs from a vSphere client library.
#[async_trait]
pub trait VsphereApi: Send + Sync {
    async fn about(&self) -> ApiResult<AboutInfo>;

    /// Clusters and hosts outside any cluster.
    async fn list_compute_resources(&self) -> ApiResult<Vec<ComputeResource>>;

    /// Datastore names reachable from a compute resource.
    async fn list_datastores(&self, target: &ComputeResource) -> ApiResult<Vec<String>>;

    /// VMs and templates, optionally limited to one compute resource.
    async fn list_vms(&self, target: Option<&ComputeResource>) -> ApiResult<Vec<VmSummary>>;

    async fn get_vm(&self, moid: &str) -> ApiResult<VmSummary>;

    /// UUID search over instance UUIDs.
    async fn find_vm_by_instance_uuid(&self, uuid: &str) -> ApiResult<Option<VmSummary>>;

    async fn vm_hardware(&self, moid: &str) -> ApiResult<VmHardware>;

    /// The task result is the new VM's managed object id.
    async fn clone_vm(&self, spec: &CloneSpec) -> ApiResult<TaskHandle>;

    async fn reconfigure_vm(&self, moid: &str, spec: &ReconfigureSpec) -> ApiResult<TaskHandle>;

    async fn power(&self, moid: &str, action: PowerAction) -> ApiResult<TaskHandle>;

    /// Ask the guest OS to reboot. Needs guest tools.
    async fn reboot_guest(&self, moid: &str) -> ApiResult<()>;

    async fn destroy_vm(&self, moid: &str) -> ApiResult<TaskHandle>;

    async fn snapshot_tree(&self, moid: &str) -> ApiResult<Vec<SnapshotNode>>;

    async fn create_snapshot(&self, moid: &str, name: &str, description: &str) -> ApiResult<TaskHandle>;

    async fn revert_snapshot(&self, moid: &str, snapshot_id: &str) -> ApiResult<TaskHandle>;

    /// Removes one snapshot, keeping its children.
    async fn remove_snapshot(&self, moid: &str, snapshot_id: &str) -> ApiResult<TaskHandle>;

    async fn acquire_console_ticket(&self, moid: &str) -> ApiResult<ConsoleTicket>;

    async fn task_info(&self, task_id: &str) -> ApiResult<TaskInfo>;
}
