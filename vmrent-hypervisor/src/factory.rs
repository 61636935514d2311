//! Adapter construction and the keyed adapter cache.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::poll::TaskPoller;
use crate::proxmox::ProxmoxAdapter;
use crate::retry::RetryPolicy;
use crate::traits::HypervisorClient;
use crate::types::{BackendKind, ConnectionSettings};
use crate::vcenter::VcenterAdapter;

/// Builds a connected adapter for a server.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Connect to the backend described by `settings`.
    ///
    /// Fails with [`crate::HypervisorError::Connection`] when the backend is
    /// unreachable or rejects the credentials.
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn HypervisorClient>>;
}

/// Production factory: the one place that switches on [`BackendKind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendConnector {
    pub retry: RetryPolicy,
    pub poller: TaskPoller,
}

impl BackendConnector {
    pub fn new(retry: RetryPolicy, poller: TaskPoller) -> Self {
        Self { retry, poller }
    }
}

#[async_trait]
impl AdapterFactory for BackendConnector {
    async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn HypervisorClient>> {
        let client: Arc<dyn HypervisorClient> = match settings.kind {
            BackendKind::Proxmox => Arc::new(ProxmoxAdapter::connect(settings, self.retry, self.poller).await?),
            BackendKind::Vcenter => Arc::new(VcenterAdapter::connect(settings, self.retry, self.poller).await?),
        };
        Ok(client)
    }
}

/// Connected adapters keyed by server id.
///
/// The cache is owned by whoever builds the controller. Changing a server's
/// connection settings must be followed by [`AdapterCache::invalidate`] for
/// that server.
pub struct AdapterCache {
    factory: Arc<dyn AdapterFactory>,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    clients: HashMap<Uuid, Arc<dyn HypervisorClient>>,
    /// Bumped by every invalidation; a connect started under an older
    /// generation is never stored.
    generations: HashMap<Uuid, u64>,
    /// Connects currently running per server.
    connecting: HashMap<Uuid, usize>,
}

impl CacheState {
    fn generation(&self, server_id: Uuid) -> u64 {
        self.generations.get(&server_id).copied().unwrap_or(0)
    }
}

/// Marks a connect in flight until dropped, so cancellation is counted too.
struct PendingConnect<'a> {
    cache: &'a AdapterCache,
    server_id: Uuid,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        let mut state = self.cache.lock();
        if let Some(count) = state.connecting.get_mut(&self.server_id) {
            *count -= 1;
            if *count == 0 {
                state.connecting.remove(&self.server_id);
            }
        }
    }
}

impl AdapterCache {
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached adapter for `server_id`, connecting on a miss.
    ///
    /// The cache lock is not held while connecting. If two callers race on a
    /// miss, the first adapter stored wins. An adapter whose connect started
    /// before an [`AdapterCache::invalidate`] is handed to its caller but not
    /// stored.
    pub async fn get_or_connect(&self, server_id: Uuid, settings: &ConnectionSettings) -> Result<Arc<dyn HypervisorClient>> {
        let generation = {
            let mut state = self.lock();
            if let Some(client) = state.clients.get(&server_id) {
                return Ok(client.clone());
            }
            *state.connecting.entry(server_id).or_default() += 1;
            state.generation(server_id)
        };
        let pending = PendingConnect { cache: self, server_id };

        debug!(server_id = %server_id, host = %settings.host, "Adapter cache miss");
        let connected = self.factory.connect(settings).await;
        drop(pending);
        let client = connected?;

        let mut state = self.lock();
        if state.generation(server_id) != generation {
            debug!(server_id = %server_id, "Server invalidated while connecting, adapter not cached");
            return Ok(client);
        }
        Ok(state.clients.entry(server_id).or_insert(client).clone())
    }

    /// Drop the cached adapter of one server and discard any connect still
    /// running for it. Returns whether there was anything to drop.
    pub async fn invalidate(&self, server_id: Uuid) -> bool {
        let mut state = self.lock();
        *state.generations.entry(server_id).or_default() += 1;
        let removed = state.clients.remove(&server_id).is_some();
        let in_flight = state.connecting.contains_key(&server_id);
        if removed || in_flight {
            info!(server_id = %server_id, in_flight, "Invalidated cached adapter");
        }
        removed || in_flight
    }

    pub async fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lock().clients.is_empty()
    }
}
