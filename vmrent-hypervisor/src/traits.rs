//! Core hypervisor client contract.

use async_trait::async_trait;

use crate::error::{HypervisorError, Result};
use crate::types::*;

/// Contract every backend adapter implements.
///
/// The lifecycle controller and the inventory synchronizer only ever talk to
/// a backend through this trait. It models exactly the operations they need,
/// not the native API surface. Instances are addressed by the pair
/// (node, backend reference); adapters whose backend addresses instances by
/// UUID alone ignore the node.
///
/// Every call runs to completion before returning: adapters for asynchronous
/// backends poll their tasks internally.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Which backend variant this adapter talks to.
    fn backend_kind(&self) -> BackendKind;

    // =========================================================================
    // Inventory
    // =========================================================================

    /// Backend product/version string.
    async fn get_version(&self) -> Result<String>;

    /// List compute nodes or clusters.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// List storages visible on a node.
    async fn list_storages(&self, node: &str) -> Result<Vec<StorageInfo>>;

    /// List templates usable on a node.
    async fn list_templates(&self, node: &str) -> Result<Vec<TemplateInfo>>;

    /// List every non-template instance on a node.
    async fn list_all_instances(&self, node: &str) -> Result<Vec<RemoteInstance>>;

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Next free instance id, or `None` when the backend assigns ids during
    /// creation.
    async fn get_next_instance_id(&self) -> Result<Option<String>>;

    /// Create a full VM from a template. Returns the new backend reference.
    async fn create_vm(&self, request: &CreateRequest) -> Result<String>;

    /// Create a container from a template file. Returns the new backend
    /// reference.
    ///
    /// Only backends that distinguish VM and container templates support this.
    async fn create_container(&self, request: &CreateRequest, root_password: &str) -> Result<String> {
        let _ = (request, root_password);
        Err(HypervisorError::Unsupported(format!(
            "{} does not provision containers",
            self.backend_kind().label()
        )))
    }

    /// Delete an instance from the backend.
    async fn delete_vm(&self, node: &str, reference: &str) -> Result<()>;

    // =========================================================================
    // Power
    // =========================================================================

    /// Power on.
    async fn start(&self, node: &str, reference: &str) -> Result<()>;

    /// Power off.
    async fn stop(&self, node: &str, reference: &str) -> Result<()>;

    /// Reboot.
    async fn reboot(&self, node: &str, reference: &str) -> Result<()>;

    /// Suspend execution.
    async fn suspend(&self, node: &str, reference: &str) -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Create a named snapshot.
    async fn create_snapshot(
        &self,
        node: &str,
        reference: &str,
        snap_name: &str,
        description: &str,
    ) -> Result<()>;

    /// Roll back to a named snapshot.
    async fn rollback_snapshot(&self, node: &str, reference: &str, snap_name: &str) -> Result<()>;

    /// Delete a named snapshot.
    async fn delete_snapshot(&self, node: &str, reference: &str, snap_name: &str) -> Result<()>;

    // =========================================================================
    // Console & configuration
    // =========================================================================

    /// One-time console URL.
    async fn get_console_url(&self, node: &str, reference: &str) -> Result<String>;

    /// Live resource configuration of an instance.
    async fn get_vm_config(&self, node: &str, reference: &str) -> Result<InstanceConfig>;
}
