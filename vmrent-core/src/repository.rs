//! Persistence interface of the rental core and an in-memory implementation.
//!
//! The core never talks to a database directly. Everything it reads or
//! writes goes through [`RentalRepository`]; batch operations take whole
//! vectors so a real store can apply them in one statement.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{RentalError, Result};
use crate::model::*;

/// Storage of servers, inventory, instances, snapshots and config backups.
#[async_trait]
pub trait RentalRepository: Send + Sync {
    // Servers

    async fn get_server(&self, id: Uuid) -> Result<Option<HypervisorServer>>;

    async fn list_servers(&self) -> Result<Vec<HypervisorServer>>;

    async fn save_server(&self, server: &HypervisorServer) -> Result<()>;

    // Inventory

    async fn get_node(&self, id: Uuid) -> Result<Option<Node>>;

    async fn list_nodes(&self, server_id: Uuid) -> Result<Vec<Node>>;

    async fn create_nodes(&self, nodes: Vec<Node>) -> Result<()>;

    /// Delete nodes and drop them from every storage's node set.
    async fn delete_nodes(&self, ids: &[Uuid]) -> Result<()>;

    async fn get_storage(&self, id: Uuid) -> Result<Option<Storage>>;

    async fn list_storages(&self, server_id: Uuid) -> Result<Vec<Storage>>;

    async fn create_storages(&self, storages: Vec<Storage>) -> Result<()>;

    /// Replace the node-visibility set of one storage.
    async fn set_storage_nodes(&self, id: Uuid, node_ids: BTreeSet<Uuid>) -> Result<()>;

    async fn delete_storages(&self, ids: &[Uuid]) -> Result<()>;

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>>;

    async fn list_templates(&self, server_id: Uuid) -> Result<Vec<Template>>;

    async fn create_templates(&self, templates: Vec<Template>) -> Result<()>;

    async fn delete_templates(&self, ids: &[Uuid]) -> Result<()>;

    // Instances

    async fn get_instance(&self, id: Uuid) -> Result<Option<VmInstance>>;

    async fn list_instances(&self) -> Result<Vec<VmInstance>>;

    /// Insert or replace an instance.
    async fn save_instance(&self, instance: &VmInstance) -> Result<()>;

    // Snapshots

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    async fn find_snapshot(&self, instance_id: Uuid, name: &str) -> Result<Option<Snapshot>>;

    async fn list_snapshots(&self, instance_id: Uuid) -> Result<Vec<Snapshot>>;

    async fn delete_snapshot(&self, id: Uuid) -> Result<()>;

    // Config backups

    async fn save_backup(&self, backup: ConfigBackup) -> Result<()>;

    async fn get_backup(&self, id: Uuid) -> Result<Option<ConfigBackup>>;

    /// Backups of one instance, or of all instances when `None`.
    async fn list_backups(&self, instance_id: Option<Uuid>) -> Result<Vec<ConfigBackup>>;

    async fn delete_backups(&self, ids: &[Uuid]) -> Result<()>;
}

// =============================================================================
// IN-MEMORY REPOSITORY
// =============================================================================

#[derive(Default)]
struct Tables {
    servers: HashMap<Uuid, HypervisorServer>,
    nodes: HashMap<Uuid, Node>,
    storages: HashMap<Uuid, Storage>,
    templates: HashMap<Uuid, Template>,
    instances: HashMap<Uuid, VmInstance>,
    snapshots: HashMap<Uuid, Snapshot>,
    backups: HashMap<Uuid, ConfigBackup>,
}

/// [`RentalRepository`] kept in process memory.
///
/// Every mutating call bumps a write counter so tests can assert that a
/// reconciliation pass did not touch the store.
#[derive(Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
    writes: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| RentalError::Repository("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.tables
            .write()
            .map_err(|_| RentalError::Repository("Lock poisoned".to_string()))
    }
}

fn sorted_by<T, F>(mut rows: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    rows.sort_by_key(|r| key(r));
    rows
}

#[async_trait]
impl RentalRepository for MemoryRepository {
    async fn get_server(&self, id: Uuid) -> Result<Option<HypervisorServer>> {
        Ok(self.read()?.servers.get(&id).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<HypervisorServer>> {
        let servers = self.read()?.servers.values().cloned().collect();
        Ok(sorted_by(servers, |s: &HypervisorServer| s.name.clone()))
    }

    async fn save_server(&self, server: &HypervisorServer) -> Result<()> {
        self.write()?.servers.insert(server.id, server.clone());
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<Node>> {
        Ok(self.read()?.nodes.get(&id).cloned())
    }

    async fn list_nodes(&self, server_id: Uuid) -> Result<Vec<Node>> {
        let nodes = self
            .read()?
            .nodes
            .values()
            .filter(|n| n.server_id == server_id)
            .cloned()
            .collect();
        Ok(sorted_by(nodes, |n: &Node| n.name.clone()))
    }

    async fn create_nodes(&self, nodes: Vec<Node>) -> Result<()> {
        let mut tables = self.write()?;
        for node in nodes {
            tables.nodes.insert(node.id, node);
        }
        Ok(())
    }

    async fn delete_nodes(&self, ids: &[Uuid]) -> Result<()> {
        let mut tables = self.write()?;
        for id in ids {
            tables.nodes.remove(id);
        }
        for storage in tables.storages.values_mut() {
            storage.node_ids.retain(|n| !ids.contains(n));
        }
        Ok(())
    }

    async fn get_storage(&self, id: Uuid) -> Result<Option<Storage>> {
        Ok(self.read()?.storages.get(&id).cloned())
    }

    async fn list_storages(&self, server_id: Uuid) -> Result<Vec<Storage>> {
        let storages = self
            .read()?
            .storages
            .values()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect();
        Ok(sorted_by(storages, |s: &Storage| s.name.clone()))
    }

    async fn create_storages(&self, storages: Vec<Storage>) -> Result<()> {
        let mut tables = self.write()?;
        for storage in storages {
            tables.storages.insert(storage.id, storage);
        }
        Ok(())
    }

    async fn set_storage_nodes(&self, id: Uuid, node_ids: BTreeSet<Uuid>) -> Result<()> {
        let mut tables = self.write()?;
        let storage = tables
            .storages
            .get_mut(&id)
            .ok_or_else(|| RentalError::not_found("Storage", id))?;
        storage.node_ids = node_ids;
        Ok(())
    }

    async fn delete_storages(&self, ids: &[Uuid]) -> Result<()> {
        let mut tables = self.write()?;
        for id in ids {
            tables.storages.remove(id);
        }
        Ok(())
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<Template>> {
        Ok(self.read()?.templates.get(&id).cloned())
    }

    async fn list_templates(&self, server_id: Uuid) -> Result<Vec<Template>> {
        let templates = self
            .read()?
            .templates
            .values()
            .filter(|t| t.server_id == server_id)
            .cloned()
            .collect();
        Ok(sorted_by(templates, |t: &Template| t.reference.clone()))
    }

    async fn create_templates(&self, templates: Vec<Template>) -> Result<()> {
        let mut tables = self.write()?;
        for template in templates {
            tables.templates.insert(template.id, template);
        }
        Ok(())
    }

    async fn delete_templates(&self, ids: &[Uuid]) -> Result<()> {
        let mut tables = self.write()?;
        for id in ids {
            tables.templates.remove(id);
        }
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<VmInstance>> {
        Ok(self.read()?.instances.get(&id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<VmInstance>> {
        let mut instances: Vec<VmInstance> = self.read()?.instances.values().cloned().collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn save_instance(&self, instance: &VmInstance) -> Result<()> {
        self.write()?.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.write()?.snapshots.insert(snapshot.id, snapshot);
        Ok(())
    }

    async fn find_snapshot(&self, instance_id: Uuid, name: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .read()?
            .snapshots
            .values()
            .find(|s| s.instance_id == instance_id && s.name == name)
            .cloned())
    }

    async fn list_snapshots(&self, instance_id: Uuid) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .read()?
            .snapshots
            .values()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }

    async fn delete_snapshot(&self, id: Uuid) -> Result<()> {
        self.write()?.snapshots.remove(&id);
        Ok(())
    }

    async fn save_backup(&self, backup: ConfigBackup) -> Result<()> {
        self.write()?.backups.insert(backup.id, backup);
        Ok(())
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<ConfigBackup>> {
        Ok(self.read()?.backups.get(&id).cloned())
    }

    async fn list_backups(&self, instance_id: Option<Uuid>) -> Result<Vec<ConfigBackup>> {
        let mut backups: Vec<ConfigBackup> = self
            .read()?
            .backups
            .values()
            .filter(|b| instance_id.map_or(true, |id| b.instance_id == id))
            .cloned()
            .collect();
        backups.sort_by_key(|b| b.created_at);
        Ok(backups)
    }

    async fn delete_backups(&self, ids: &[Uuid]) -> Result<()> {
        let mut tables = self.write()?;
        for id in ids {
            tables.backups.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmrent_hypervisor::InstanceKind;

    #[tokio::test]
    async fn test_node_delete_cascades_into_storages() {
        let repo = MemoryRepository::new();
        let server = Uuid::new_v4();
        let a = Node::new(server, "pve1");
        let b = Node::new(server, "pve2");
        let shared = Storage::new(server, "ceph", [a.id, b.id].into_iter().collect());
        repo.create_nodes(vec![a.clone(), b.clone()]).await.unwrap();
        repo.create_storages(vec![shared.clone()]).await.unwrap();

        repo.delete_nodes(&[a.id]).await.unwrap();

        let storage = repo.get_storage(shared.id).await.unwrap().unwrap();
        assert_eq!(storage.node_ids, [b.id].into_iter().collect());
        assert_eq!(repo.list_nodes(server).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listings_are_ordered() {
        let repo = MemoryRepository::new();
        let server = Uuid::new_v4();
        repo.create_nodes(vec![Node::new(server, "pve2"), Node::new(server, "pve1")])
            .await
            .unwrap();
        repo.create_templates(vec![
            Template::new(server, "alpha", "9001", InstanceKind::Vm),
            Template::new(server, "zulu", "9000", InstanceKind::Vm),
        ])
        .await
        .unwrap();

        let nodes: Vec<_> = repo.list_nodes(server).await.unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(nodes, ["pve1", "pve2"]);
        let templates: Vec<_> = repo
            .list_templates(server)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.reference)
            .collect();
        assert_eq!(templates, ["9000", "9001"]);
    }

    #[tokio::test]
    async fn test_reads_do_not_count_as_writes() {
        let repo = MemoryRepository::new();
        let server = Uuid::new_v4();
        repo.create_nodes(vec![Node::new(server, "pve1")]).await.unwrap();
        assert_eq!(repo.writes(), 1);

        repo.list_nodes(server).await.unwrap();
        repo.list_storages(server).await.unwrap();
        repo.list_instances().await.unwrap();
        assert_eq!(repo.writes(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_lookup_is_per_instance() {
        let repo = MemoryRepository::new();
        let vm = Uuid::new_v4();
        repo.create_snapshot(Snapshot {
            id: Uuid::new_v4(),
            instance_id: vm,
            name: "before-upgrade".to_string(),
            description: String::new(),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

        assert!(repo.find_snapshot(vm, "before-upgrade").await.unwrap().is_some());
        assert!(repo.find_snapshot(Uuid::new_v4(), "before-upgrade").await.unwrap().is_none());
    }
}
