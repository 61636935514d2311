//! Import of instances that already exist on a backend.
//!
//! A [`LinkingJob`] is fetched, reviewed and linked:
//! 1. `fetch_linking` lists every remote instance on the server's nodes and
//!    stages the ones no local record references yet.
//! 2. The operator selects lines with [`LinkingJob::select`].
//! 3. `link_selected` reads the live configuration of each selected line and
//!    creates an instance record for it.

use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vmrent_common::TimedOperation;
use vmrent_hypervisor::PowerState;

use crate::audit::AuditAction;
use crate::controller::VmController;
use crate::error::{RentalError, Result};
use crate::model::*;
use crate::resources::ResourceSpec;

/// Outcome of linking the selected lines of a job.
#[derive(Debug, Clone, Default)]
pub struct LinkReport {
    pub created: Vec<VmInstance>,
    /// Lines not linked, as (reference, reason)
    pub skipped: Vec<(String, String)>,
    /// References linked with fallback resources
    pub fallbacks: Vec<String>,
}

impl VmController {
    /// New draft job for `server_id` and `customer_id`.
    pub async fn start_linking(&self, server_id: Uuid, customer_id: Uuid) -> Result<LinkingJob> {
        if self.repository().get_server(server_id).await?.is_none() {
            return Err(RentalError::not_found("Hypervisor server", server_id));
        }
        Ok(LinkingJob::new(server_id, customer_id))
    }

    /// Stage every remote instance of the job's server that is not linked to
    /// a local record. Replaces previously staged lines.
    #[instrument(skip(self, job), fields(job_id = %job.id, server_id = %job.server_id))]
    pub async fn fetch_linking(&self, job: &mut LinkingJob) -> Result<usize> {
        if job.state == LinkingState::Done {
            return Err(RentalError::InvalidState("linking job is already done".to_string()));
        }
        let repo = self.repository();
        let nodes = repo.list_nodes(job.server_id).await?;
        if nodes.is_empty() {
            return Err(RentalError::Validation(
                "No nodes found for this server. Please synchronize resources first".to_string(),
            ));
        }

        let linked: HashSet<String> = repo
            .list_instances()
            .await?
            .into_iter()
            .filter(|vm| vm.server_id == job.server_id)
            .filter_map(|vm| vm.backend.map(|b| b.reference))
            .collect();

        let adapter = self.adapter_for(job.server_id).await?;
        let mut lines = Vec::new();
        for node in &nodes {
            for remote in adapter.list_all_instances(&node.name).await? {
                if remote.name.is_empty() || linked.contains(&remote.reference) {
                    continue;
                }
                lines.push(LinkingLine {
                    name: remote.name,
                    reference: remote.reference,
                    node: node.name.clone(),
                    status: remote.status,
                    kind: remote.kind,
                    selected: false,
                });
            }
        }

        info!(staged = lines.len(), already_linked = linked.len(), "Remote instances fetched");
        job.lines = lines;
        job.state = LinkingState::Fetched;
        Ok(job.lines.len())
    }

    /// Create an instance record for every selected line.
    ///
    /// Resources come from the backend. When the live configuration cannot
    /// be read the line is linked with the defaults of its instance type.
    #[instrument(skip(self, job), fields(job_id = %job.id, server_id = %job.server_id))]
    pub async fn link_selected(&self, job: &mut LinkingJob) -> Result<LinkReport> {
        if job.state != LinkingState::Fetched {
            return Err(RentalError::InvalidState(
                "fetch remote instances before linking".to_string(),
            ));
        }
        let selected: Vec<LinkingLine> = job.lines.iter().filter(|l| l.selected).cloned().collect();
        if selected.is_empty() {
            return Err(RentalError::Validation("Please select at least one VM to link".to_string()));
        }

        let repo = self.repository();
        let node_ids: HashMap<String, Uuid> = repo
            .list_nodes(job.server_id)
            .await?
            .into_iter()
            .map(|n| (n.name, n.id))
            .collect();
        let adapter = self.adapter_for(job.server_id).await?;

        let mut report = LinkReport::default();
        for line in selected {
            let timer = TimedOperation::start("link");
            let resources = match adapter.get_vm_config(&line.node, &line.reference).await {
                Ok(config) => ResourceSpec::from(config),
                Err(e) => {
                    let fallback = ResourceSpec::fallback_for(line.kind);
                    warn!(
                        reference = %line.reference,
                        kind = %line.kind,
                        error = %e,
                        resources = %fallback,
                        "Live configuration unavailable, linking with default resources"
                    );
                    report.fallbacks.push(line.reference.clone());
                    fallback
                }
            };

            let mut vm = VmInstance::new(line.name.as_str(), job.customer_id, job.server_id, resources);
            vm.node_id = node_ids.get(&line.node).copied();
            vm.kind = line.kind;
            vm.state = if PowerState::from_backend(&line.status) == PowerState::Running {
                VmState::Active
            } else {
                VmState::Stopped
            };
            vm.backend = Some(BackendPlacement {
                reference: line.reference.clone(),
                node: line.node.clone(),
            });
            vm.start_date = Some(Utc::now().date_naive());

            let result = match self.settings().limits.validate(&vm.resources) {
                Ok(()) => repo.save_instance(&vm).await,
                Err(e) => Err(e),
            };
            let metadata = json!({"reference": line.reference, "node": line.node});
            self.record(vm.id, AuditAction::Link, &timer, &result, metadata).await;
            match result {
                Ok(()) => {
                    info!(vm_id = %vm.id, reference = %line.reference, resources = %vm.resources, "Instance linked");
                    report.created.push(vm);
                }
                Err(e) => {
                    warn!(reference = %line.reference, error = %e, "Instance not linked");
                    report.skipped.push((line.reference.clone(), e.to_string()));
                }
            }
        }

        job.state = LinkingState::Done;
        Ok(report)
    }
}
