//! Explicit per-network registry of sync coordinators.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use stakeidx_chain_index::IndexStore;
use stakeidx_operations::ShutdownAware;

use crate::client::ChainClient;
use crate::coordinator::SyncCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::status::SyncStatus;

/// Object-safe view of one network's sync, so coordinators over different
/// clients and stores share a registry.
#[async_trait]
pub trait NetworkSync: Send + Sync {
    fn network(&self) -> &str;
    fn start(&self) -> SyncResult<()>;
    async fn stop(&self) -> SyncResult<()>;
    fn status(&self) -> SyncStatus;
}

#[async_trait]
impl<C, S> NetworkSync for SyncCoordinator<C, S>
where
    C: ChainClient + 'static,
    S: IndexStore + 'static,
{
    fn network(&self) -> &str {
        SyncCoordinator::network(self)
    }

    fn start(&self) -> SyncResult<()> {
        SyncCoordinator::start(self)
    }

    async fn stop(&self) -> SyncResult<()> {
        SyncCoordinator::stop(self).await
    }

    fn status(&self) -> SyncStatus {
        SyncCoordinator::status(self)
    }
}

/// Coordinators keyed by network name, built once at startup.
#[derive(Default)]
pub struct NetworkRegistry {
    networks: RwLock<BTreeMap<String, Arc<dyn NetworkSync>>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sync: Arc<dyn NetworkSync>) -> SyncResult<()> {
        let mut networks = self.networks.write();
        let name = sync.network().to_string();
        if networks.contains_key(&name) {
            return Err(SyncError::DuplicateNetwork(name));
        }
        tracing::debug!(network = %name, "Registered network");
        networks.insert(name, sync);
        Ok(())
    }

    pub fn get(&self, network: &str) -> SyncResult<Arc<dyn NetworkSync>> {
        self.networks
            .read()
            .get(network)
            .cloned()
            .ok_or_else(|| SyncError::UnknownNetwork(network.to_string()))
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.read().keys().cloned().collect()
    }

    pub fn start(&self, network: &str) -> SyncResult<()> {
        self.get(network)?.start()
    }

    pub async fn stop(&self, network: &str) -> SyncResult<()> {
        let sync = self.get(network)?;
        sync.stop().await
    }

    /// Start every registered network. Returns the first failure after trying
    /// them all.
    pub fn start_all(&self) -> SyncResult<()> {
        let mut first_error = None;
        for sync in self.snapshot() {
            if let Err(e) = sync.start() {
                tracing::error!(network = %sync.network(), error = %e, "Failed to start sync");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn stop_all(&self) -> SyncResult<()> {
        let mut first_error = None;
        for sync in self.snapshot() {
            if let Err(e) = sync.stop().await {
                tracing::error!(network = %sync.network(), error = %e, "Failed to stop sync");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.snapshot().iter().map(|s| s.status()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn NetworkSync>> {
        self.networks.read().values().cloned().collect()
    }
}

#[async_trait]
impl ShutdownAware for NetworkRegistry {
    fn name(&self) -> &str {
        "sync-registry"
    }

    async fn shutdown(&self, _timeout: Duration) {
        if let Err(e) = self.stop_all().await {
            tracing::warn!(error = %e, "Not every network stopped cleanly");
        }
    }
}
