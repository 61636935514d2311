//! Resource inventory synchronizer.
//!
//! Reconciles the locally cached nodes, storages and templates of a server
//! against what its adapter reports live. Reconciliation only adds what is
//! new, removes what is gone and rewrites what changed: instances hold
//! references into the inventory, so rows that still exist are never
//! recreated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;
use vmrent_hypervisor::HypervisorClient;

use crate::error::Result;
use crate::model::{ConnectionStatus, HypervisorServer, Node, Storage, Template};
use crate::repository::RentalRepository;

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub version: String,
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub storages_added: usize,
    pub storages_updated: usize,
    pub storages_removed: usize,
    pub templates_added: usize,
    pub templates_removed: usize,
}

impl SyncReport {
    /// True when the pass found nothing to change.
    pub fn is_unchanged(&self) -> bool {
        self.nodes_added == 0
            && self.nodes_removed == 0
            && self.storages_added == 0
            && self.storages_updated == 0
            && self.storages_removed == 0
            && self.templates_added == 0
            && self.templates_removed == 0
    }
}

/// Persist the connection status of a server. An unchanged status is not
/// rewritten.
pub(crate) async fn record_server_status(
    repo: &dyn RentalRepository,
    server: &HypervisorServer,
    status: ConnectionStatus,
    message: String,
) -> Result<()> {
    let mut current = repo.get_server(server.id).await?.unwrap_or_else(|| server.clone());
    if current.status == status && current.status_message == message {
        return Ok(());
    }
    current.status = status;
    current.status_message = message;
    repo.save_server(&current).await
}

/// Reconciles cached inventory with a live backend.
pub struct InventorySynchronizer {
    repo: Arc<dyn RentalRepository>,
}

impl InventorySynchronizer {
    pub fn new(repo: Arc<dyn RentalRepository>) -> Self {
        Self { repo }
    }

    /// Reconcile the inventory of `server` and record the outcome in its
    /// connection status.
    ///
    /// Any failure marks the server `failed` with the error text and is
    /// returned to the caller.
    #[instrument(skip(self, server, client), fields(server_id = %server.id, server = %server.name))]
    pub async fn sync(&self, server: &HypervisorServer, client: &dyn HypervisorClient) -> Result<SyncReport> {
        match self.reconcile(server.id, client).await {
            Ok(report) => {
                info!(
                    version = %report.version,
                    nodes_added = report.nodes_added,
                    nodes_removed = report.nodes_removed,
                    storages_added = report.storages_added,
                    storages_updated = report.storages_updated,
                    storages_removed = report.storages_removed,
                    templates_added = report.templates_added,
                    templates_removed = report.templates_removed,
                    "Inventory synchronized"
                );
                let message = format!("Connected to {}", report.version);
                record_server_status(self.repo.as_ref(), server, ConnectionStatus::Connected, message).await?;
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Inventory synchronization failed");
                record_server_status(self.repo.as_ref(), server, ConnectionStatus::Failed, e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn reconcile(&self, server_id: Uuid, client: &dyn HypervisorClient) -> Result<SyncReport> {
        let mut report = SyncReport {
            version: client.get_version().await?,
            ..SyncReport::default()
        };

        let nodes = self.sync_nodes(server_id, client, &mut report).await?;
        self.sync_storages(server_id, client, &nodes, &mut report).await?;
        self.sync_templates(server_id, client, &nodes, &mut report).await?;

        Ok(report)
    }

    /// Reconcile nodes. Returns the surviving nodes by name.
    async fn sync_nodes(
        &self,
        server_id: Uuid,
        client: &dyn HypervisorClient,
        report: &mut SyncReport,
    ) -> Result<BTreeMap<String, Uuid>> {
        let live: BTreeSet<String> = client.list_nodes().await?.into_iter().map(|n| n.name).collect();
        let cached = self.repo.list_nodes(server_id).await?;

        let removed: Vec<Uuid> = cached.iter().filter(|n| !live.contains(&n.name)).map(|n| n.id).collect();
        let mut nodes: BTreeMap<String, Uuid> = cached
            .into_iter()
            .filter(|n| live.contains(&n.name))
            .map(|n| (n.name, n.id))
            .collect();

        let added: Vec<Node> = live
            .iter()
            .filter(|name| !nodes.contains_key(*name))
            .map(|name| Node::new(server_id, name.as_str()))
            .collect();
        nodes.extend(added.iter().map(|n| (n.name.clone(), n.id)));

        report.nodes_added = added.len();
        report.nodes_removed = removed.len();
        if !added.is_empty() {
            self.repo.create_nodes(added).await?;
        }
        if !removed.is_empty() {
            self.repo.delete_nodes(&removed).await?;
        }
        Ok(nodes)
    }

    /// Reconcile storages and the nodes each one is visible on.
    async fn sync_storages(
        &self,
        server_id: Uuid,
        client: &dyn HypervisorClient,
        nodes: &BTreeMap<String, Uuid>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut visibility: BTreeMap<String, BTreeSet<Uuid>> = BTreeMap::new();
        for (node_name, node_id) in nodes {
            for storage in client.list_storages(node_name).await? {
                visibility.entry(storage.name).or_default().insert(*node_id);
            }
        }

        let cached = self.repo.list_storages(server_id).await?;
        let cached_names: BTreeSet<&str> = cached.iter().map(|s| s.name.as_str()).collect();

        let mut removed = Vec::new();
        for storage in &cached {
            match visibility.get(&storage.name) {
                None => removed.push(storage.id),
                Some(node_ids) if *node_ids != storage.node_ids => {
                    debug!(storage = %storage.name, "Storage visibility changed");
                    self.repo.set_storage_nodes(storage.id, node_ids.clone()).await?;
                    report.storages_updated += 1;
                }
                Some(_) => {}
            }
        }

        let added: Vec<Storage> = visibility
            .iter()
            .filter(|(name, _)| !cached_names.contains(name.as_str()))
            .map(|(name, node_ids)| Storage::new(server_id, name.as_str(), node_ids.clone()))
            .collect();

        report.storages_added = added.len();
        report.storages_removed = removed.len();
        if !added.is_empty() {
            self.repo.create_storages(added).await?;
        }
        if !removed.is_empty() {
            self.repo.delete_storages(&removed).await?;
        }
        Ok(())
    }

    /// Reconcile templates. A reference reported by several nodes is one
    /// template.
    async fn sync_templates(
        &self,
        server_id: Uuid,
        client: &dyn HypervisorClient,
        nodes: &BTreeMap<String, Uuid>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let mut live = HashMap::new();
        for node_name in nodes.keys() {
            for template in client.list_templates(node_name).await? {
                live.entry(template.reference.clone()).or_insert(template);
            }
        }

        let cached = self.repo.list_templates(server_id).await?;
        let removed: Vec<Uuid> = cached
            .iter()
            .filter(|t| !live.contains_key(&t.reference))
            .map(|t| t.id)
            .collect();
        let cached_refs: BTreeSet<&str> = cached.iter().map(|t| t.reference.as_str()).collect();

        let mut added: Vec<Template> = live
            .into_values()
            .filter(|t| !cached_refs.contains(t.reference.as_str()))
            .map(|t| Template::new(server_id, t.name, t.reference, t.kind))
            .collect();
        added.sort_by(|a, b| a.reference.cmp(&b.reference));

        report.templates_added = added.len();
        report.templates_removed = removed.len();
        if !added.is_empty() {
            self.repo.create_templates(added).await?;
        }
        if !removed.is_empty() {
            self.repo.delete_templates(&removed).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use vmrent_hypervisor::{BackendKind, ConnectionSettings, Credentials, InstanceKind, MockBackend};

    fn server() -> HypervisorServer {
        HypervisorServer::new(
            "lab",
            ConnectionSettings {
                kind: BackendKind::Proxmox,
                host: "10.0.0.5".to_string(),
                port: None,
                credentials: Credentials::Password {
                    username: "root@pam".to_string(),
                    password: "secret".to_string(),
                },
                verify_tls: false,
            },
        )
    }

    #[tokio::test]
    async fn test_template_reported_by_two_nodes_is_stored_once() {
        let repo = Arc::new(MemoryRepository::new());
        let server = server();
        repo.save_server(&server).await.unwrap();
        let backend = MockBackend::new(BackendKind::Proxmox)
            .with_node("pve1")
            .with_node("pve2")
            .with_template("pve1", "9000", "debian-12", InstanceKind::Vm)
            .with_template("pve2", "9000", "debian-12", InstanceKind::Vm);

        let report = InventorySynchronizer::new(repo.clone()).sync(&server, &backend).await.unwrap();

        assert_eq!(report.nodes_added, 2);
        assert_eq!(report.templates_added, 1);
        assert_eq!(repo.list_templates(server.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_marks_server_failed() {
        let repo = Arc::new(MemoryRepository::new());
        let server = server();
        repo.save_server(&server).await.unwrap();
        let backend = MockBackend::demo(BackendKind::Proxmox);
        backend.fail_on(
            "list_storages",
            vmrent_hypervisor::HypervisorError::Operation("pool offline".to_string()),
        );

        let result = InventorySynchronizer::new(repo.clone()).sync(&server, &backend).await;

        assert!(result.is_err());
        let stored = repo.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Failed);
        assert!(stored.status_message.contains("pool offline"));
    }

    #[tokio::test]
    async fn test_success_embeds_version() {
        let repo = Arc::new(MemoryRepository::new());
        let server = server();
        repo.save_server(&server).await.unwrap();
        let backend = MockBackend::demo(BackendKind::Proxmox);

        InventorySynchronizer::new(repo.clone()).sync(&server, &backend).await.unwrap();

        let stored = repo.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConnectionStatus::Connected);
        assert!(stored.status_message.contains("(mock)"));
    }
}
