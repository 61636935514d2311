//! [`VsphereApi`] over the vSphere Automation REST API (`/api`).
//!
//! Authentication is session based: `POST /api/session` with basic auth
//! returns a session id that is sent as `vmware-api-session-id` on every
//! request. An expired session is renewed once, transparently.
//!
//! Known gaps compared to the SOAP API:
//! - datastores are not scoped to a compute resource, every datastore is
//!   returned;
//! - the template flag is read from the VM detail when the server reports it;
//! - there is no server-side UUID search, lookups scan the VM list.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use urlencoding::encode;

use super::api::*;
use crate::error::TransportError;
use crate::types::{ConnectionSettings, Credentials};

const SESSION_HEADER: &str = "vmware-api-session-id";

pub struct RestVsphereApi {
    base_url: String,
    http_client: reqwest::Client,
    username: String,
    password: String,
    session: RwLock<Option<String>>,
}

impl RestVsphereApi {
    /// Per-attempt request timeout.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Build a client for the given server. Does not log in.
    pub fn new(settings: &ConnectionSettings) -> ApiResult<Self> {
        let (username, password) = match &settings.credentials {
            Credentials::Password { username, password } => (username.clone(), password.clone()),
            Credentials::ApiToken { .. } => {
                return Err(TransportError::Auth {
                    status: 0,
                    message: "vCenter connections require a username and password".to_string(),
                })
            }
        };

        let http_client = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(Self {
            base_url: format!("https://{}:{}/api", settings.host, settings.effective_port()),
            http_client,
            username,
            password,
            session: RwLock::new(None),
        })
    }

    /// Open a new session.
    pub async fn login(&self) -> ApiResult<()> {
        info!(user = %self.username, "Logging in to vCenter");

        let response = self
            .http_client
            .post(format!("{}/session", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::from_status(status.as_u16(), body.trim()));
        }

        let session: String = serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))?;
        *self.session.write().await = Some(session);
        Ok(())
    }

    async fn send(&self, method: Method, path: &str, query: &[(&str, &str)], body: Option<&Value>) -> ApiResult<Value> {
        match self.send_once(method.clone(), path, query, body).await {
            Err(e) if e.is_auth() => {
                debug!(path = %path, "vCenter session rejected, logging in again");
                self.login().await?;
                self.send_once(method, path, query, body).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> ApiResult<Value> {
        let session = self.session.read().await.clone().ok_or_else(|| TransportError::Auth {
            status: 401,
            message: "no vCenter session".to_string(),
        })?;

        debug!(method = %method, path = %path, "vCenter request");
        let mut request = self
            .http_client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, session)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::from_status(status.as_u16(), error_message(&text)));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> ApiResult<Value> {
        self.send(Method::GET, path, query, None).await
    }

    async fn vm_detail(&self, moid: &str) -> ApiResult<Value> {
        self.get(&format!("/vcenter/vm/{}", encode(moid)), &[]).await
    }

    async fn datastore_id(&self, name: &str) -> ApiResult<String> {
        let found = self.get("/vcenter/datastore", &[("names", name)]).await?;
        items(&found)
            .iter()
            .find_map(|d| str_field(d, "datastore"))
            .ok_or_else(|| TransportError::Status {
                status: 404,
                message: format!("Datastore '{}' not found", name),
            })
    }
}

#[async_trait]
impl VsphereApi for RestVsphereApi {
    async fn about(&self) -> ApiResult<AboutInfo> {
        let version = self.get("/appliance/system/version", &[]).await?;
        let product = str_field(&version, "product").unwrap_or_else(|| "VMware vCenter Server".to_string());
        let full_name = match (str_field(&version, "version"), str_field(&version, "build")) {
            (Some(v), Some(b)) => format!("{} {} build-{}", product, v, b),
            (Some(v), None) => format!("{} {}", product, v),
            _ => product,
        };
        Ok(AboutInfo {
            full_name,
            instance_uuid: None,
        })
    }

    async fn list_compute_resources(&self) -> ApiResult<Vec<ComputeResource>> {
        let clusters = self.get("/vcenter/cluster", &[]).await?;
        let hosts = self.get("/vcenter/host", &[]).await?;

        let mut resources = Vec::new();
        let mut clustered: HashSet<String> = HashSet::new();
        for cluster in items(&clusters) {
            let (Some(moid), Some(name)) = (str_field(cluster, "cluster"), str_field(cluster, "name")) else {
                continue;
            };
            let members = self.get("/vcenter/host", &[("clusters", moid.as_str())]).await?;
            clustered.extend(items(&members).iter().filter_map(|h| str_field(h, "host")));
            resources.push(ComputeResource {
                moid,
                name,
                kind: ComputeResourceKind::Cluster,
            });
        }

        for host in items(&hosts) {
            let (Some(moid), Some(name)) = (str_field(host, "host"), str_field(host, "name")) else {
                continue;
            };
            if !clustered.contains(&moid) {
                resources.push(ComputeResource {
                    moid,
                    name,
                    kind: ComputeResourceKind::Host,
                });
            }
        }

        Ok(resources)
    }

    async fn list_datastores(&self, _target: &ComputeResource) -> ApiResult<Vec<String>> {
        let datastores = self.get("/vcenter/datastore", &[]).await?;
        Ok(items(&datastores).iter().filter_map(|d| str_field(d, "name")).collect())
    }

    async fn list_vms(&self, target: Option<&ComputeResource>) -> ApiResult<Vec<VmSummary>> {
        let filter: Vec<(&str, &str)> = match target {
            Some(r) if r.kind == ComputeResourceKind::Cluster => vec![("clusters", r.moid.as_str())],
            Some(r) => vec![("hosts", r.moid.as_str())],
            None => Vec::new(),
        };
        let listing = self.get("/vcenter/vm", &filter).await?;

        let mut vms = Vec::new();
        for entry in items(&listing) {
            let Some(moid) = str_field(entry, "vm") else {
                continue;
            };
            let detail = self.vm_detail(&moid).await?;
            vms.push(parse_vm_summary(&moid, &detail));
        }
        Ok(vms)
    }

    async fn get_vm(&self, moid: &str) -> ApiResult<VmSummary> {
        let detail = self.vm_detail(moid).await?;
        Ok(parse_vm_summary(moid, &detail))
    }

    async fn find_vm_by_instance_uuid(&self, uuid: &str) -> ApiResult<Option<VmSummary>> {
        let vms = self.list_vms(None).await?;
        Ok(vms.into_iter().find(|vm| vm.instance_uuid.eq_ignore_ascii_case(uuid)))
    }

    async fn vm_hardware(&self, moid: &str) -> ApiResult<VmHardware> {
        let detail = self.vm_detail(moid).await?;
        Ok(parse_vm_hardware(&detail))
    }

    async fn clone_vm(&self, spec: &CloneSpec) -> ApiResult<TaskHandle> {
        let datastore = self.datastore_id(&spec.datastore).await?;
        let placement_key = match spec.target.kind {
            ComputeResourceKind::Cluster => "cluster",
            ComputeResourceKind::Host => "host",
        };
        let body = json!({
            "source": spec.template_moid,
            "name": spec.name,
            "placement": {
                placement_key: spec.target.moid,
                "datastore": datastore,
            },
            "power_on": spec.power_on,
        });

        let task = self
            .send(
                Method::POST,
                "/vcenter/vm",
                &[("action", "clone"), ("vmw-task", "true")],
                Some(&body),
            )
            .await?;
        task_handle(task)
    }

    async fn reconfigure_vm(&self, moid: &str, spec: &ReconfigureSpec) -> ApiResult<TaskHandle> {
        let hardware = format!("/vcenter/vm/{}/hardware", encode(moid));
        self.send(Method::PATCH, &format!("{}/cpu", hardware), &[], Some(&json!({ "count": spec.num_cpu })))
            .await?;
        self.send(
            Method::PATCH,
            &format!("{}/memory", hardware),
            &[],
            Some(&json!({ "size_MiB": spec.memory_mib })),
        )
        .await?;
        if let Some(disk) = &spec.disk {
            self.send(
                Method::PATCH,
                &format!("{}/disk/{}", hardware, encode(&disk.key)),
                &[],
                Some(&json!({ "capacity": disk.capacity_kib * 1024 })),
            )
            .await?;
        }
        Ok(TaskHandle::Done(Value::Null))
    }

    async fn power(&self, moid: &str, action: PowerAction) -> ApiResult<TaskHandle> {
        let action = match action {
            PowerAction::On => "start",
            PowerAction::Off => "stop",
            PowerAction::Suspend => "suspend",
            PowerAction::Reset => "reset",
        };
        let path = format!("/vcenter/vm/{}/power", encode(moid));
        self.send(Method::POST, &path, &[("action", action)], None).await?;
        Ok(TaskHandle::Done(Value::Null))
    }

    async fn reboot_guest(&self, moid: &str) -> ApiResult<()> {
        let path = format!("/vcenter/vm/{}/guest/power", encode(moid));
        self.send(Method::POST, &path, &[("action", "reboot")], None).await?;
        Ok(())
    }

    async fn destroy_vm(&self, moid: &str) -> ApiResult<TaskHandle> {
        self.send(Method::DELETE, &format!("/vcenter/vm/{}", encode(moid)), &[], None)
            .await?;
        Ok(TaskHandle::Done(Value::Null))
    }

    async fn snapshot_tree(&self, moid: &str) -> ApiResult<Vec<SnapshotNode>> {
        let listing = self.get(&format!("/vcenter/vm/{}/snapshots", encode(moid)), &[]).await?;
        Ok(parse_snapshot_nodes(&listing))
    }

    async fn create_snapshot(&self, moid: &str, name: &str, description: &str) -> ApiResult<TaskHandle> {
        let body = json!({
            "name": name,
            "description": description,
            "memory": false,
            "quiesce": true,
        });
        let created = self
            .send(
                Method::POST,
                &format!("/vcenter/vm/{}/snapshots", encode(moid)),
                &[],
                Some(&body),
            )
            .await?;
        Ok(TaskHandle::Done(created))
    }

    async fn revert_snapshot(&self, moid: &str, snapshot_id: &str) -> ApiResult<TaskHandle> {
        let path = format!("/vcenter/vm/{}/snapshots/{}", encode(moid), encode(snapshot_id));
        self.send(Method::POST, &path, &[("action", "revert")], None).await?;
        Ok(TaskHandle::Done(Value::Null))
    }

    async fn remove_snapshot(&self, moid: &str, snapshot_id: &str) -> ApiResult<TaskHandle> {
        let path = format!("/vcenter/vm/{}/snapshots/{}", encode(moid), encode(snapshot_id));
        self.send(Method::DELETE, &path, &[], None).await?;
        Ok(TaskHandle::Done(Value::Null))
    }

    async fn acquire_console_ticket(&self, moid: &str) -> ApiResult<ConsoleTicket> {
        let path = format!("/vcenter/vm/{}/console/tickets", encode(moid));
        let ticket = self
            .send(Method::POST, &path, &[], Some(&json!({ "type": "WEBMKS" })))
            .await?;
        str_field(&ticket, "ticket")
            .and_then(|url| parse_console_ticket(&url))
            .ok_or_else(|| TransportError::Decode("console ticket without a usable URL".to_string()))
    }

    async fn task_info(&self, task_id: &str) -> ApiResult<TaskInfo> {
        let task = self.get(&format!("/cis/tasks/{}", encode(task_id)), &[]).await?;
        Ok(parse_task_info(&task))
    }
}

// =============================================================================
// RESPONSE PARSING
// =============================================================================

fn items(value: &Value) -> &[Value] {
    value.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Pull the first human readable message out of a vAPI error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("messages")
                .and_then(|m| m.get(0))
                .and_then(|m| m.get("default_message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

fn task_handle(value: Value) -> ApiResult<TaskHandle> {
    match value {
        Value::String(id) => Ok(TaskHandle::Remote(id)),
        other => Err(TransportError::Decode(format!("expected a task id, got {}", other))),
    }
}

fn parse_vm_summary(moid: &str, detail: &Value) -> VmSummary {
    VmSummary {
        moid: moid.to_string(),
        name: str_field(detail, "name").unwrap_or_else(|| moid.to_string()),
        instance_uuid: detail
            .get("identity")
            .and_then(|i| str_field(i, "instance_uuid"))
            .unwrap_or_default(),
        power_state: str_field(detail, "power_state").unwrap_or_else(|| "unknown".to_string()),
        template: detail.get("template").and_then(Value::as_bool).unwrap_or(false),
    }
}

fn parse_vm_hardware(detail: &Value) -> VmHardware {
    let disks = detail
        .get("disks")
        .and_then(Value::as_object)
        .map(|disks| {
            disks
                .iter()
                .map(|(key, disk)| VirtualDisk {
                    key: key.clone(),
                    label: str_field(disk, "label").unwrap_or_default(),
                    capacity_kib: disk.get("capacity").and_then(Value::as_u64).unwrap_or(0) / 1024,
                })
                .collect()
        })
        .unwrap_or_default();

    VmHardware {
        num_cpu: detail
            .pointer("/cpu/count")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32,
        memory_mib: detail.pointer("/memory/size_MiB").and_then(Value::as_u64).unwrap_or(0),
        disks,
    }
}

fn parse_snapshot_nodes(value: &Value) -> Vec<SnapshotNode> {
    items(value)
        .iter()
        .filter_map(|entry| {
            Some(SnapshotNode {
                id: str_field(entry, "snapshot")?,
                name: str_field(entry, "name")?,
                children: entry.get("children").map(parse_snapshot_nodes).unwrap_or_default(),
            })
        })
        .collect()
}

/// `wss://esx01.lab:443/ticket/abcdef` -> host, port and ticket.
fn parse_console_ticket(url: &str) -> Option<ConsoleTicket> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let (authority, path) = rest.split_once('/')?;
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, 443),
    };
    let ticket = path.strip_prefix("ticket/").unwrap_or(path);
    if host.is_empty() || ticket.is_empty() {
        return None;
    }
    Some(ConsoleTicket {
        host: host.to_string(),
        port,
        ticket: ticket.to_string(),
    })
}

fn parse_task_info(task: &Value) -> TaskInfo {
    let state = match task.get("status").and_then(Value::as_str) {
        Some("SUCCEEDED") => TaskState::Success,
        Some("FAILED") => TaskState::Error,
        Some("RUNNING") | Some("BLOCKED") => TaskState::Running,
        _ => TaskState::Queued,
    };
    let error = task.get("error").map(|e| {
        e.get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("default_message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| e.to_string())
    });
    TaskInfo {
        state,
        result: task.get("result").cloned(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_hardware_converts_bytes() {
        let detail = json!({
            "name": "web-01",
            "cpu": {"count": 4},
            "memory": {"size_MiB": 8192},
            "disks": {
                "2000": {"label": "Hard disk 1", "capacity": 21474836480u64},
                "2001": {"label": "Hard disk 2", "capacity": 10737418240u64}
            }
        });
        let hw = parse_vm_hardware(&detail);
        assert_eq!(hw.num_cpu, 4);
        assert_eq!(hw.memory_mib, 8192);
        assert_eq!(hw.disks.len(), 2);
        assert_eq!(hw.disks[0].capacity_kib, 20 * 1024 * 1024);
    }

    #[test]
    fn test_parse_vm_summary_reads_identity() {
        let detail = json!({
            "name": "db-01",
            "power_state": "POWERED_ON",
            "identity": {"instance_uuid": "5003c1a4-aaaa-bbbb-cccc-000000000001"}
        });
        let vm = parse_vm_summary("vm-42", &detail);
        assert_eq!(vm.instance_uuid, "5003c1a4-aaaa-bbbb-cccc-000000000001");
        assert_eq!(vm.power(), crate::types::PowerState::Running);
        assert!(!vm.template);
    }

    #[test]
    fn test_parse_console_ticket() {
        let ticket = parse_console_ticket("wss://esx01.lab:902/ticket/5e1f9a").unwrap();
        assert_eq!(ticket.host, "esx01.lab");
        assert_eq!(ticket.port, 902);
        assert_eq!(ticket.ticket, "5e1f9a");
        assert!(parse_console_ticket("garbage").is_none());
    }

    #[test]
    fn test_parse_task_info_failure_message() {
        let task = json!({
            "status": "FAILED",
            "error": {"messages": [{"default_message": "Insufficient disk space on datastore"}]}
        });
        let info = parse_task_info(&task);
        assert_eq!(info.state, TaskState::Error);
        assert_eq!(info.error.as_deref(), Some("Insufficient disk space on datastore"));
    }

    #[test]
    fn test_error_message_prefers_vapi_text() {
        let body = r#"{"error_type":"NOT_FOUND","messages":[{"default_message":"VM vm-9 not found"}]}"#;
        assert_eq!(error_message(body), "VM vm-9 not found");
        assert_eq!(error_message("plain failure "), "plain failure");
    }
}
