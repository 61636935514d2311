//! Proxmox-style adapter.
//!
//! Instances are addressed by (node name, VMID). Full VMs live under the
//! `qemu` endpoints and containers under `lxc`, so every call that targets an
//! existing instance first classifies it by probing both listings once.
//!
//! ```text
//! create_vm:        clone ──► wait task ──► config (cores/memory) ──► resize disk
//! create_container: lxc create (inline resources + network) ──► wait task
//! ```

mod transport;

pub use transport::{HttpProxmoxTransport, Params, ProxmoxTransport};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use urlencoding::encode;

use crate::error::{HypervisorError, Result};
use crate::poll::{TaskPoller, TaskProgress};
use crate::retry::RetryPolicy;
use crate::traits::HypervisorClient;
use crate::types::*;

/// Default network for new containers.
const CONTAINER_NET0: &str = "name=eth0,bridge=vmbr0,ip=dhcp";

/// Disk keys inspected, in order, when reading a VM's disk size.
const VM_DISK_KEYS: [&str; 4] = ["scsi0", "virtio0", "sata0", "ide0"];

/// Outcome of classifying an existing instance.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Probe {
    kind: InstanceKind,
    status: String,
}

/// Adapter for node/VMID addressed backends.
pub struct ProxmoxAdapter {
    host: String,
    port: u16,
    transport: Arc<dyn ProxmoxTransport>,
    retry: RetryPolicy,
    poller: TaskPoller,
}

impl ProxmoxAdapter {
    /// Connect to a server and verify the connection with a version call.
    ///
    /// Fails fast with [`HypervisorError::Connection`].
    pub async fn connect(settings: &ConnectionSettings, retry: RetryPolicy, poller: TaskPoller) -> Result<Self> {
        info!(host = %settings.host, port = settings.effective_port(), "Connecting to Proxmox");

        let connection_error = |e: crate::error::TransportError| {
            HypervisorError::Connection(format!("Could not connect to Proxmox host {}: {}", settings.host, e))
        };

        let transport = HttpProxmoxTransport::new(settings).map_err(connection_error)?;
        let adapter = Self::with_transport(&settings.host, settings.effective_port(), Arc::new(transport))
            .with_retry(retry)
            .with_poller(poller);

        let transport = adapter.transport.clone();
        retry
            .run("/version", move || {
                let transport = transport.clone();
                async move { transport.request(Method::GET, "/version", Vec::new()).await }
            })
            .await
            .map_err(connection_error)?;

        info!(host = %settings.host, "Connected to Proxmox");
        Ok(adapter)
    }

    /// Build an adapter over an existing transport.
    pub fn with_transport(host: impl Into<String>, port: u16, transport: Arc<dyn ProxmoxTransport>) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            retry: RetryPolicy::default(),
            poller: TaskPoller::default(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the task poller.
    pub fn with_poller(mut self, poller: TaskPoller) -> Self {
        self.poller = poller;
        self
    }

    /// One API call under the retry policy, translated into the error taxonomy.
    async fn call(&self, method: Method, path: &str, params: Params) -> Result<Value> {
        let transport = &self.transport;
        self.retry
            .run(path, move || transport.request(method.clone(), path, params.clone()))
            .await
            .map_err(|e| {
                warn!(path = %path, error = %e, "Proxmox API call failed");
                HypervisorError::from(e)
            })
    }

    /// Wait for a UPID returned by an asynchronous endpoint. Values that are
    /// not task ids finish immediately.
    async fn wait_for_task(&self, node: &str, result: &Value) -> Result<()> {
        let upid = match result.as_str() {
            Some(upid) if upid.starts_with("UPID:") => upid.to_string(),
            _ => return Ok(()),
        };

        let path = format!("{}/tasks/{}/status", node_path(node), encode(&upid));
        self.poller
            .wait(&upid, move || {
                let path = path.clone();
                async move {
                    let status = self.call(Method::GET, &path, Vec::new()).await?;
                    Ok::<_, HypervisorError>(task_progress(&status))
                }
            })
            .await
            .map(|_| ())
    }

    /// Classify an existing instance as VM or container.
    ///
    /// Both listings are fetched once per logical operation; callers pass the
    /// result on instead of probing again.
    async fn probe(&self, node: &str, vmid: &str) -> Result<Probe> {
        let qemu = self.call(Method::GET, &format!("{}/qemu", node_path(node)), Vec::new()).await?;
        let lxc = self.call(Method::GET, &format!("{}/lxc", node_path(node)), Vec::new()).await?;

        let classified = find_vmid(&qemu, vmid)
            .map(|entry| (InstanceKind::Vm, entry))
            .or_else(|| find_vmid(&lxc, vmid).map(|entry| (InstanceKind::Container, entry)));

        match classified {
            Some((kind, entry)) => {
                let status = entry.get("status").and_then(Value::as_str).unwrap_or("unknown").to_string();
                debug!(node = %node, vmid = %vmid, kind = %kind, status = %status, "Classified instance");
                Ok(Probe { kind, status })
            }
            None => Err(HypervisorError::NotFound(format!("instance {} not found on node {}", vmid, node))),
        }
    }

    async fn power(&self, node: &str, vmid: &str, action: &str) -> Result<()> {
        let probe = self.probe(node, vmid).await?;
        let path = format!("{}/status/{}", instance_path(node, probe.kind, vmid), action);
        let result = self.call(Method::POST, &path, Vec::new()).await?;
        self.wait_for_task(node, &result).await?;
        info!(node = %node, vmid = %vmid, action = %action, "Power action completed");
        Ok(())
    }

    async fn snapshot_target(&self, node: &str, vmid: &str) -> Result<String> {
        let probe = self.probe(node, vmid).await?;
        if !probe.kind.supports_snapshots() {
            return Err(HypervisorError::Unsupported(format!(
                "snapshots are not supported for {} {}",
                probe.kind, vmid
            )));
        }
        Ok(format!("{}/snapshot", instance_path(node, probe.kind, vmid)))
    }

    fn require_id(request: &CreateRequest) -> Result<String> {
        request
            .id
            .clone()
            .ok_or_else(|| HypervisorError::Operation("Proxmox provisioning requires a pre-assigned VMID".to_string()))
    }
}

#[async_trait]
impl HypervisorClient for ProxmoxAdapter {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Proxmox
    }

    async fn get_version(&self) -> Result<String> {
        let version = self.call(Method::GET, "/version", Vec::new()).await?;
        Ok(version
            .get("version")
            .and_then(value_to_string)
            .unwrap_or_else(|| "N/A".to_string()))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.call(Method::GET, "/nodes", Vec::new()).await?;
        Ok(as_array(&nodes)
            .iter()
            .filter_map(|n| n.get("node").and_then(Value::as_str))
            .map(|name| NodeInfo {
                id: name.to_string(),
                name: name.to_string(),
            })
            .collect())
    }

    async fn list_storages(&self, node: &str) -> Result<Vec<StorageInfo>> {
        let storages = self.call(Method::GET, &format!("{}/storage", node_path(node)), Vec::new()).await?;
        Ok(as_array(&storages)
            .iter()
            .filter(|s| s.get("active").and_then(value_to_u64) == Some(1))
            .filter_map(|s| s.get("storage").and_then(Value::as_str))
            .map(|name| StorageInfo {
                id: name.to_string(),
                name: name.to_string(),
            })
            .collect())
    }

    #[instrument(skip(self), fields(node = %node))]
    async fn list_templates(&self, node: &str) -> Result<Vec<TemplateInfo>> {
        let mut templates = Vec::new();

        let qemu = self.call(Method::GET, &format!("{}/qemu", node_path(node)), Vec::new()).await?;
        for vm in as_array(&qemu) {
            if vm.get("template").and_then(value_to_u64) != Some(1) {
                continue;
            }
            if let Some(vmid) = vm.get("vmid").and_then(value_to_string) {
                let name = vm.get("name").and_then(Value::as_str).unwrap_or("template");
                templates.push(TemplateInfo {
                    id: vmid.clone(),
                    name: format!("{} (ID: {})", name, vmid),
                    reference: vmid,
                    kind: InstanceKind::Vm,
                });
            }
        }

        let storages = self.call(Method::GET, &format!("{}/storage", node_path(node)), Vec::new()).await?;
        for storage in as_array(&storages) {
            let holds_templates = storage
                .get("content")
                .and_then(Value::as_str)
                .map(|c| c.contains("vztmpl"))
                .unwrap_or(false);
            let Some(storage_name) = storage.get("storage").and_then(Value::as_str) else {
                continue;
            };
            if !holds_templates {
                continue;
            }

            let path = format!("{}/storage/{}/content", node_path(node), encode(storage_name));
            let contents = self
                .call(Method::GET, &path, vec![("content", "vztmpl".to_string())])
                .await?;
            for item in as_array(&contents) {
                if item.get("content").and_then(Value::as_str).is_some_and(|c| c != "vztmpl") {
                    continue;
                }
                if let Some(volid) = item.get("volid").and_then(Value::as_str) {
                    templates.push(TemplateInfo {
                        id: volid.to_string(),
                        name: volid.rsplit('/').next().unwrap_or(volid).to_string(),
                        reference: volid.to_string(),
                        kind: InstanceKind::Container,
                    });
                }
            }
        }

        debug!(count = templates.len(), "Listed templates");
        Ok(templates)
    }

    async fn list_all_instances(&self, node: &str) -> Result<Vec<RemoteInstance>> {
        let mut instances = Vec::new();

        let qemu = self.call(Method::GET, &format!("{}/qemu", node_path(node)), Vec::new()).await?;
        for vm in as_array(&qemu) {
            if vm.get("template").and_then(value_to_u64) == Some(1) {
                continue;
            }
            if let Some(vmid) = vm.get("vmid").and_then(value_to_string) {
                instances.push(RemoteInstance {
                    name: vm
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("VM-{}", vmid)),
                    status: vm.get("status").and_then(Value::as_str).unwrap_or("unknown").to_string(),
                    reference: vmid,
                    kind: InstanceKind::Vm,
                });
            }
        }

        let lxc = self.call(Method::GET, &format!("{}/lxc", node_path(node)), Vec::new()).await?;
        for ct in as_array(&lxc) {
            if let Some(vmid) = ct.get("vmid").and_then(value_to_string) {
                let name = ct
                    .get("name")
                    .or_else(|| ct.get("hostname"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Container-{}", vmid));
                instances.push(RemoteInstance {
                    name,
                    status: ct.get("status").and_then(Value::as_str).unwrap_or("unknown").to_string(),
                    reference: vmid,
                    kind: InstanceKind::Container,
                });
            }
        }

        Ok(instances)
    }

    async fn get_next_instance_id(&self) -> Result<Option<String>> {
        let next = self.call(Method::GET, "/cluster/nextid", Vec::new()).await?;
        value_to_string(&next)
            .map(Some)
            .ok_or_else(|| HypervisorError::Operation("Could not fetch the next available VMID".to_string()))
    }

    #[instrument(skip(self, request), fields(node = %request.node, name = %request.name, template = %request.template_ref))]
    async fn create_vm(&self, request: &CreateRequest) -> Result<String> {
        let vmid = Self::require_id(request)?;
        info!(vmid = %vmid, "Cloning VM from template");

        let clone_path = format!("{}/clone", instance_path(&request.node, InstanceKind::Vm, &request.template_ref));
        let task = self
            .call(
                Method::POST,
                &clone_path,
                vec![
                    ("newid", vmid.clone()),
                    ("name", request.name.clone()),
                    ("full", "1".to_string()),
                    ("storage", request.storage.clone()),
                    ("target", request.node.clone()),
                ],
            )
            .await?;
        self.wait_for_task(&request.node, &task).await?;

        let vm_path = instance_path(&request.node, InstanceKind::Vm, &vmid);
        let task = self
            .call(
                Method::POST,
                &format!("{}/config", vm_path),
                vec![
                    ("cores", request.cores.to_string()),
                    ("memory", request.memory_mib.to_string()),
                ],
            )
            .await?;
        self.wait_for_task(&request.node, &task).await?;

        let current = self.call(Method::GET, &format!("{}/config", vm_path), Vec::new()).await?;
        let (disk, current_gib) = primary_disk(&current).unwrap_or((VM_DISK_KEYS[0], 0));
        if current_gib >= request.disk_gib {
            debug!(vmid = %vmid, disk = %disk, current_gib, requested_gib = request.disk_gib, "Disk already large enough");
        } else {
            self.call(
                Method::PUT,
                &format!("{}/resize", vm_path),
                vec![("disk", disk.to_string()), ("size", format!("{}G", request.disk_gib))],
            )
            .await?;
        }

        info!(vmid = %vmid, "VM created");
        Ok(vmid)
    }

    #[instrument(skip(self, request, root_password), fields(node = %request.node, name = %request.name))]
    async fn create_container(&self, request: &CreateRequest, root_password: &str) -> Result<String> {
        let vmid = Self::require_id(request)?;
        info!(vmid = %vmid, template = %request.template_ref, "Creating container");

        let task = self
            .call(
                Method::POST,
                &format!("{}/lxc", node_path(&request.node)),
                vec![
                    ("vmid", vmid.clone()),
                    ("hostname", request.name.clone()),
                    ("ostemplate", request.template_ref.clone()),
                    ("storage", request.storage.clone()),
                    ("password", root_password.to_string()),
                    ("cores", request.cores.to_string()),
                    ("memory", request.memory_mib.to_string()),
                    ("rootfs", format!("{}:{}", request.storage, request.disk_gib)),
                    ("net0", CONTAINER_NET0.to_string()),
                ],
            )
            .await?;
        self.wait_for_task(&request.node, &task).await?;

        info!(vmid = %vmid, "Container created");
        Ok(vmid)
    }

    #[instrument(skip(self), fields(node = %node, vmid = %reference))]
    async fn delete_vm(&self, node: &str, reference: &str) -> Result<()> {
        let probe = self.probe(node, reference).await?;
        let path = instance_path(node, probe.kind, reference);

        if PowerState::from_backend(&probe.status) != PowerState::Stopped {
            info!("Stopping instance before deletion");
            let task = self.call(Method::POST, &format!("{}/status/stop", path), Vec::new()).await?;
            self.wait_for_task(node, &task).await?;
        }

        let task = self.call(Method::DELETE, &path, Vec::new()).await?;
        self.wait_for_task(node, &task).await?;
        info!("Instance deleted");
        Ok(())
    }

    async fn start(&self, node: &str, reference: &str) -> Result<()> {
        self.power(node, reference, "start").await
    }

    async fn stop(&self, node: &str, reference: &str) -> Result<()> {
        self.power(node, reference, "stop").await
    }

    async fn reboot(&self, node: &str, reference: &str) -> Result<()> {
        self.power(node, reference, "reboot").await
    }

    async fn suspend(&self, node: &str, reference: &str) -> Result<()> {
        self.power(node, reference, "suspend").await
    }

    #[instrument(skip(self, description), fields(node = %node, vmid = %reference, snapshot = %snap_name))]
    async fn create_snapshot(&self, node: &str, reference: &str, snap_name: &str, description: &str) -> Result<()> {
        let path = self.snapshot_target(node, reference).await?;
        let task = self
            .call(
                Method::POST,
                &path,
                vec![
                    ("snapname", snap_name.to_string()),
                    ("description", description.to_string()),
                ],
            )
            .await?;
        self.wait_for_task(node, &task).await?;
        info!("Snapshot created");
        Ok(())
    }

    #[instrument(skip(self), fields(node = %node, vmid = %reference, snapshot = %snap_name))]
    async fn rollback_snapshot(&self, node: &str, reference: &str, snap_name: &str) -> Result<()> {
        let path = self.snapshot_target(node, reference).await?;
        let task = self
            .call(Method::POST, &format!("{}/{}/rollback", path, encode(snap_name)), Vec::new())
            .await?;
        self.wait_for_task(node, &task).await?;
        info!("Rolled back to snapshot");
        Ok(())
    }

    #[instrument(skip(self), fields(node = %node, vmid = %reference, snapshot = %snap_name))]
    async fn delete_snapshot(&self, node: &str, reference: &str, snap_name: &str) -> Result<()> {
        let path = self.snapshot_target(node, reference).await?;
        let task = self
            .call(Method::DELETE, &format!("{}/{}", path, encode(snap_name)), Vec::new())
            .await?;
        self.wait_for_task(node, &task).await?;
        info!("Snapshot deleted");
        Ok(())
    }

    async fn get_console_url(&self, node: &str, reference: &str) -> Result<String> {
        let probe = self.probe(node, reference).await?;
        let proxy = self
            .call(
                Method::POST,
                &format!("{}/vncproxy", instance_path(node, probe.kind, reference)),
                Vec::new(),
            )
            .await?;

        let ticket = proxy
            .get("ticket")
            .and_then(Value::as_str)
            .ok_or_else(|| HypervisorError::Operation("Could not get VNC proxy info from Proxmox".to_string()))?;
        let console = match probe.kind {
            InstanceKind::Vm => "kvm",
            InstanceKind::Container => "lxc",
        };

        Ok(format!(
            "https://{}:{}/?console={}&vmid={}&node={}&vnc_ticket={}",
            self.host,
            self.port,
            console,
            encode(reference),
            encode(node),
            encode(ticket)
        ))
    }

    async fn get_vm_config(&self, node: &str, reference: &str) -> Result<InstanceConfig> {
        let probe = self.probe(node, reference).await?;
        let config = self
            .call(
                Method::GET,
                &format!("{}/config", instance_path(node, probe.kind, reference)),
                Vec::new(),
            )
            .await?;
        parse_instance_config(&config, probe.kind)
            .ok_or_else(|| HypervisorError::Operation(format!("Cannot read configuration of {} {}", probe.kind, reference)))
    }
}

// =============================================================================
// RESPONSE HELPERS
// =============================================================================

fn instance_path(node: &str, kind: InstanceKind, vmid: &str) -> String {
    let segment = match kind {
        InstanceKind::Vm => "qemu",
        InstanceKind::Container => "lxc",
    };
    format!("{}/{}/{}", node_path(node), segment, encode(vmid))
}

fn node_path(node: &str) -> String {
    format!("/nodes/{}", encode(node))
}

fn as_array(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn find_vmid<'a>(listing: &'a Value, vmid: &str) -> Option<&'a Value> {
    as_array(listing)
        .iter()
        .find(|entry| entry.get("vmid").and_then(value_to_string).as_deref() == Some(vmid))
}

fn task_progress(status: &Value) -> TaskProgress {
    match status.get("status").and_then(Value::as_str) {
        Some("stopped") => match status.get("exitstatus").and_then(Value::as_str) {
            Some("OK") => TaskProgress::Succeeded(status.clone()),
            Some(exit) => TaskProgress::Failed(exit.to_string()),
            None => TaskProgress::Failed("task stopped without exit status".to_string()),
        },
        _ => TaskProgress::Pending,
    }
}

/// Parse a `size=` attribute out of a Proxmox volume spec into whole GiB,
/// rounding up. A bare number is a byte count; `K`, `M`, `G` and `T` are
/// binary multiples and may carry a fractional part (`2.5G`).
fn parse_disk_size(spec: &str) -> Option<u64> {
    const GIB: u128 = 1 << 30;

    let size = spec.split(',').find_map(|part| part.trim().strip_prefix("size="))?;
    let split = size.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(size.len());
    let (mantissa, unit) = size.split_at(split);

    let multiplier: u128 = match unit {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return None,
    };

    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if whole.is_empty() || fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let scale = 10u128.pow(fraction.len() as u32);
    let scaled = whole
        .parse::<u128>()
        .ok()?
        .checked_mul(scale)?
        .checked_add(if fraction.is_empty() { 0 } else { fraction.parse::<u128>().ok()? })?;

    let bytes = scaled.checked_mul(multiplier)?.div_ceil(scale);
    u64::try_from(bytes.div_ceil(GIB)).ok()
}

/// First non-cdrom VM disk with a readable size, as (key, GiB).
fn primary_disk(config: &Value) -> Option<(&'static str, u64)> {
    VM_DISK_KEYS.iter().find_map(|key| {
        let spec = config.get(*key)?.as_str()?;
        if spec.contains("media=cdrom") {
            return None;
        }
        Some((*key, parse_disk_size(spec)?))
    })
}

fn parse_instance_config(config: &Value, kind: InstanceKind) -> Option<InstanceConfig> {
    let cores = config.get("cores").and_then(value_to_u64).unwrap_or(1) as u32;
    let memory_mib = config.get("memory").and_then(value_to_u64)?;

    let disk_gib = match kind {
        InstanceKind::Vm => primary_disk(config).map(|(_, size)| size),
        InstanceKind::Container => config.get("rootfs").and_then(Value::as_str).and_then(parse_disk_size),
    }?;

    Some(InstanceConfig {
        cores,
        memory_mib,
        disk_gib,
        kind,
    })
}
