//! vCenter-style adapter.
//!
//! Instances are addressed by their instance UUID, looked up on every call
//! so the reference stays valid when a VM moves between hosts. The node
//! argument of instance operations is ignored.
//!
//! Every mutation returns a task which is polled to completion with the
//! adapter's [`TaskPoller`] before the call returns.

mod api;
mod rest;

pub use api::*;
pub use rest::RestVsphereApi;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use urlencoding::encode;

use crate::error::{HypervisorError, Result, TransportError};
use crate::poll::{TaskPoller, TaskProgress};
use crate::retry::RetryPolicy;
use crate::traits::HypervisorClient;
use crate::types::*;

/// Adapter for UUID addressed backends.
pub struct VcenterAdapter {
    host: String,
    api: Arc<dyn VsphereApi>,
    retry: RetryPolicy,
    poller: TaskPoller,
}

impl VcenterAdapter {
    /// Log in and verify the connection. Fails fast with
    /// [`HypervisorError::Connection`].
    pub async fn connect(settings: &ConnectionSettings, retry: RetryPolicy, poller: TaskPoller) -> Result<Self> {
        info!(host = %settings.host, "Connecting to vCenter");

        let connection_error = |e: TransportError| {
            HypervisorError::Connection(format!("Could not connect to vCenter {}: {}", settings.host, e))
        };

        let api = RestVsphereApi::new(settings).map_err(connection_error)?;
        retry
            .run("login", || api.login())
            .await
            .map_err(connection_error)?;

        let about = api.about().await.map_err(connection_error)?;
        info!(host = %settings.host, version = %about.full_name, "Connected to vCenter");

        Ok(Self::with_api(&settings.host, Arc::new(api))
            .with_retry(retry)
            .with_poller(poller))
    }

    /// Build an adapter over an existing client.
    pub fn with_api(host: impl Into<String>, api: Arc<dyn VsphereApi>) -> Self {
        Self {
            host: host.into(),
            api,
            retry: RetryPolicy::default(),
            poller: TaskPoller::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poller(mut self, poller: TaskPoller) -> Self {
        self.poller = poller;
        self
    }

    /// One API call under the retry policy.
    async fn call<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        self.retry.run(what, call).await.map_err(|e| {
            warn!(operation = %what, error = %e, "vCenter API call failed");
            HypervisorError::from(e)
        })
    }

    /// Poll a task until it finishes; returns the task result.
    async fn wait(&self, what: &str, handle: TaskHandle) -> Result<Value> {
        let task_id = match handle {
            TaskHandle::Done(value) => return Ok(value),
            TaskHandle::Remote(task_id) => task_id,
        };

        let task_id = task_id.as_str();
        let api = &self.api;
        self.poller
            .wait(what, move || async move {
                let info = self.call("task_info", move || api.task_info(task_id)).await?;
                Ok::<_, HypervisorError>(match info.state {
                    TaskState::Queued | TaskState::Running => TaskProgress::Pending,
                    TaskState::Success => TaskProgress::Succeeded(info.result.unwrap_or(Value::Null)),
                    TaskState::Error => {
                        TaskProgress::Failed(info.error.unwrap_or_else(|| "unknown task error".to_string()))
                    }
                })
            })
            .await
    }

    /// Find a VM by instance UUID.
    async fn resolve(&self, uuid: &str) -> Result<VmSummary> {
        let api = &self.api;
        self.call("find_vm_by_instance_uuid", move || api.find_vm_by_instance_uuid(uuid))
            .await?
            .ok_or_else(|| HypervisorError::NotFound(format!("VM with UUID {} not found", uuid)))
    }

    /// Find a cluster or standalone host by name.
    async fn compute_resource(&self, name: &str) -> Result<Option<ComputeResource>> {
        let api = &self.api;
        let resources = self
            .call("list_compute_resources", move || api.list_compute_resources())
            .await?;
        Ok(resources.into_iter().find(|r| r.name == name))
    }

    async fn power(&self, vm: &VmSummary, action: PowerAction) -> Result<()> {
        let api = &self.api;
        let moid = vm.moid.as_str();
        let task = self.call("power", move || api.power(moid, action)).await?;
        self.wait("power", task).await?;
        Ok(())
    }

    async fn find_snapshot(&self, vm: &VmSummary, snap_name: &str) -> Result<SnapshotNode> {
        let api = &self.api;
        let moid = vm.moid.as_str();
        let tree = self.call("snapshot_tree", move || api.snapshot_tree(moid)).await?;
        SnapshotNode::find(&tree, snap_name)
            .cloned()
            .ok_or_else(|| HypervisorError::NotFound(format!("Snapshot '{}' not found", snap_name)))
    }
}

#[async_trait]
impl HypervisorClient for VcenterAdapter {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Vcenter
    }

    async fn get_version(&self) -> Result<String> {
        let api = &self.api;
        let about = self.call("about", move || api.about()).await?;
        Ok(about.full_name)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let api = &self.api;
        let resources = self
            .call("list_compute_resources", move || api.list_compute_resources())
            .await?;

        let mut seen = HashSet::new();
        Ok(resources
            .into_iter()
            .filter(|r| seen.insert(r.name.clone()))
            .map(|r| NodeInfo {
                id: r.name.clone(),
                name: r.name,
            })
            .collect())
    }

    async fn list_storages(&self, node: &str) -> Result<Vec<StorageInfo>> {
        let Some(target) = self.compute_resource(node).await? else {
            warn!(node = %node, "Compute resource not found, no storages listed");
            return Ok(Vec::new());
        };

        let api = &self.api;
        let target = &target;
        let datastores = self.call("list_datastores", move || api.list_datastores(target)).await?;
        Ok(datastores
            .into_iter()
            .map(|name| StorageInfo {
                id: name.clone(),
                name,
            })
            .collect())
    }

    async fn list_templates(&self, _node: &str) -> Result<Vec<TemplateInfo>> {
        let api = &self.api;
        let vms = self.call("list_vms", move || api.list_vms(None)).await?;
        Ok(vms
            .into_iter()
            .filter(|vm| vm.template)
            .map(|vm| TemplateInfo {
                id: vm.instance_uuid.clone(),
                name: vm.name,
                reference: vm.instance_uuid,
                kind: InstanceKind::Vm,
            })
            .collect())
    }

    async fn list_all_instances(&self, node: &str) -> Result<Vec<RemoteInstance>> {
        let Some(target) = self.compute_resource(node).await? else {
            warn!(node = %node, "Compute resource not found, no instances listed");
            return Ok(Vec::new());
        };

        let api = &self.api;
        let target = &target;
        let vms = self.call("list_vms", move || api.list_vms(Some(target))).await?;
        Ok(vms
            .into_iter()
            .filter(|vm| !vm.template)
            .map(|vm| RemoteInstance {
                reference: vm.instance_uuid,
                name: vm.name,
                status: vm.power_state,
                kind: InstanceKind::Vm,
            })
            .collect())
    }

    async fn get_next_instance_id(&self) -> Result<Option<String>> {
        Ok(None)
    }

    #[instrument(skip(self, request), fields(node = %request.node, name = %request.name, template = %request.template_ref))]
    async fn create_vm(&self, request: &CreateRequest) -> Result<String> {
        let template = self.resolve(&request.template_ref).await?;
        let target = self.compute_resource(&request.node).await?.ok_or_else(|| {
            HypervisorError::NotFound(format!("Target node (cluster or host) '{}' not found", request.node))
        })?;

        info!(template_moid = %template.moid, target = %target.moid, "Cloning template");
        let spec = CloneSpec {
            template_moid: template.moid.clone(),
            name: request.name.clone(),
            target,
            datastore: request.storage.clone(),
            power_on: false,
        };
        let api = &self.api;
        let spec = &spec;
        let task = self.call("clone_vm", move || api.clone_vm(spec)).await?;
        let result = self.wait("clone_vm", task).await?;
        let moid = result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| HypervisorError::Operation("clone task did not return the new VM".to_string()))?;

        let moid_ref = moid.as_str();
        let hardware = self.call("vm_hardware", move || api.vm_hardware(moid_ref)).await?;
        let reconfigure = ReconfigureSpec {
            num_cpu: request.cores,
            memory_mib: request.memory_mib,
            disk: hardware.disks.first().map(|d| DiskResize {
                key: d.key.clone(),
                capacity_kib: request.disk_gib * 1024 * 1024,
            }),
        };
        let reconfigure = &reconfigure;
        let task = self
            .call("reconfigure_vm", move || api.reconfigure_vm(moid_ref, reconfigure))
            .await?;
        self.wait("reconfigure_vm", task).await?;

        let task = self.call("power", move || api.power(moid_ref, PowerAction::On)).await?;
        self.wait("power", task).await?;

        let created = self.call("get_vm", move || api.get_vm(moid_ref)).await?;
        info!(moid = %moid, uuid = %created.instance_uuid, "VM created");
        Ok(created.instance_uuid)
    }

    #[instrument(skip(self, _node), fields(uuid = %reference))]
    async fn delete_vm(&self, _node: &str, reference: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        if vm.power() == PowerState::Running {
            info!("Powering off before deletion");
            self.power(&vm, PowerAction::Off).await?;
        }

        let api = &self.api;
        let moid = vm.moid.as_str();
        let task = self.call("destroy_vm", move || api.destroy_vm(moid)).await?;
        self.wait("destroy_vm", task).await?;
        info!("VM deleted");
        Ok(())
    }

    async fn start(&self, _node: &str, reference: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        if vm.power() == PowerState::Running {
            return Ok(());
        }
        self.power(&vm, PowerAction::On).await
    }

    async fn stop(&self, _node: &str, reference: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        if vm.power() == PowerState::Stopped {
            return Ok(());
        }
        self.power(&vm, PowerAction::Off).await
    }

    async fn reboot(&self, _node: &str, reference: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        let api = &self.api;
        let moid = vm.moid.as_str();
        match self.call("reboot_guest", move || api.reboot_guest(moid)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(uuid = %reference, error = %e, "Guest reboot failed, resetting");
                self.power(&vm, PowerAction::Reset).await
            }
        }
    }

    async fn suspend(&self, _node: &str, reference: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        if vm.power() != PowerState::Running {
            return Ok(());
        }
        self.power(&vm, PowerAction::Suspend).await
    }

    #[instrument(skip(self, _node, description), fields(uuid = %reference, snapshot = %snap_name))]
    async fn create_snapshot(&self, _node: &str, reference: &str, snap_name: &str, description: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        let api = &self.api;
        let moid = vm.moid.as_str();
        let task = self
            .call("create_snapshot", move || api.create_snapshot(moid, snap_name, description))
            .await?;
        self.wait("create_snapshot", task).await?;
        info!("Snapshot created");
        Ok(())
    }

    #[instrument(skip(self, _node), fields(uuid = %reference, snapshot = %snap_name))]
    async fn rollback_snapshot(&self, _node: &str, reference: &str, snap_name: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        let snapshot = self.find_snapshot(&vm, snap_name).await?;

        let api = &self.api;
        let moid = vm.moid.as_str();
        let snapshot_id = snapshot.id.as_str();
        let task = self
            .call("revert_snapshot", move || api.revert_snapshot(moid, snapshot_id))
            .await?;
        self.wait("revert_snapshot", task).await?;
        info!("Reverted to snapshot");
        Ok(())
    }

    #[instrument(skip(self, _node), fields(uuid = %reference, snapshot = %snap_name))]
    async fn delete_snapshot(&self, _node: &str, reference: &str, snap_name: &str) -> Result<()> {
        let vm = self.resolve(reference).await?;
        let snapshot = self.find_snapshot(&vm, snap_name).await?;

        let api = &self.api;
        let moid = vm.moid.as_str();
        let snapshot_id = snapshot.id.as_str();
        let task = self
            .call("remove_snapshot", move || api.remove_snapshot(moid, snapshot_id))
            .await?;
        self.wait("remove_snapshot", task).await?;
        info!("Snapshot removed");
        Ok(())
    }

    async fn get_console_url(&self, _node: &str, reference: &str) -> Result<String> {
        let vm = self.resolve(reference).await?;
        let api = &self.api;
        let moid = vm.moid.as_str();
        let ticket = self
            .call("acquire_console_ticket", move || api.acquire_console_ticket(moid))
            .await?;
        let about = self.call("about", move || api.about()).await?;

        Ok(format!(
            "https://{}/ui/webconsole.html?vmId={}&vmName={}&serverGuid={}&host={}:{}&ticket={}",
            self.host,
            encode(&vm.moid),
            encode(&vm.name),
            encode(about.instance_uuid.as_deref().unwrap_or_default()),
            ticket.host,
            ticket.port,
            encode(&ticket.ticket)
        ))
    }

    async fn get_vm_config(&self, _node: &str, reference: &str) -> Result<InstanceConfig> {
        let vm = self.resolve(reference).await?;
        let api = &self.api;
        let moid = vm.moid.as_str();
        let hardware = self.call("vm_hardware", move || api.vm_hardware(moid)).await?;

        Ok(InstanceConfig {
            cores: hardware.num_cpu,
            memory_mib: hardware.memory_mib,
            disk_gib: hardware.disks.iter().map(|d| d.capacity_kib / 1024 / 1024).sum(),
            kind: InstanceKind::Vm,
        })
    }
}
