// ContainerStore: the executor's registry of containers and their lifecycle.

use cell_common::constants::EVENT_CHANNEL_CAPACITY;
use cell_common::ExecutorSettings;
use cell_sdk::{LogSink, LogStreamer};
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod container_reaper;
pub mod node_map;
pub mod registry_pruner;
pub mod store_node;

pub use container_reaper::{ContainerReaper, ReapReport};
pub use node_map::{ContainerRegistry, NodeMap};
pub use registry_pruner::RegistryPruner;
pub use store_node::{ContainerSnapshot, ContainerState, RunResult, StoreNode};

use crate::cache::{CachedDownloader, Uploader};
use crate::container::{ContainerBackend, ContainerSpec};
use crate::dependency_manager::{DependencyError, DependencyManager};
use crate::transformer::{TransformError, Transformer};

#[derive(Debug, thiserror::Error)]
pub enum ContainerStoreError {
    #[error("container {0} not found")]
    NotFound(String),

    #[error("container {0} already exists")]
    AlreadyExists(String),

    #[error("container {guid} cannot move from {from} to {to}")]
    InvalidTransition {
        guid: String,
        from: ContainerState,
        to: ContainerState,
    },

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("container backend error: {0:#}")]
    Backend(anyhow::Error),

    #[error("failed to cleanup bindmount artifacts: {0}")]
    BindMountCleanupFailed(#[source] DependencyError),
}

pub struct ContainerStore {
    owner_name: String,
    settings: ExecutorSettings,
    backend: Arc<dyn ContainerBackend>,
    dependencies: DependencyManager,
    transformer: Transformer,
    nodes: Arc<NodeMap>,
    sink: Arc<dyn LogSink>,
    events: broadcast::Sender<ContainerSnapshot>,
}

impl ContainerStore {
    /// Build a store. The download limiter is shared by the dependency
    /// manager and every download step.
    pub fn new(
        settings: &ExecutorSettings,
        backend: Arc<dyn ContainerBackend>,
        cache: Arc<dyn CachedDownloader>,
        uploader: Arc<dyn Uploader>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let download_limiter = settings.download_limiter();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            owner_name: settings.owner_name.clone(),
            settings: settings.clone(),
            backend,
            dependencies: DependencyManager::new(Arc::clone(&cache), download_limiter.clone()),
            transformer: Transformer::new(settings, cache, uploader, download_limiter),
            nodes: Arc::new(NodeMap::new()),
            sink,
            events,
        }
    }

    /// Receive a snapshot of every container state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerSnapshot> {
        self.events.subscribe()
    }

    fn node(&self, guid: &str) -> Result<Arc<StoreNode>, ContainerStoreError> {
        self.nodes
            .get(guid)
            .ok_or_else(|| ContainerStoreError::NotFound(guid.to_string()))
    }

    pub fn reserve(&self, spec: ContainerSpec) -> Result<ContainerSnapshot, ContainerStoreError> {
        let guid = spec.guid.clone();
        let streamer = LogStreamer::new(Arc::clone(&self.sink), spec.log_source.clone());
        let node = Arc::new(StoreNode::new(spec, streamer, self.events.clone()));
        let snapshot = node.snapshot();
        self.nodes.add(Arc::clone(&node))?;
        node.announce();
        tracing::info!(guid = %guid, "container-reserved");
        Ok(snapshot)
    }

    pub async fn create(&self, guid: &str) -> Result<ContainerSnapshot, ContainerStoreError> {
        let node = self.node(guid)?;
        node.create(self.backend.as_ref(), &self.dependencies, &self.owner_name)
            .await?;
        tracing::info!(guid = %guid, "container-created");
        Ok(node.snapshot())
    }

    pub async fn run(&self, guid: &str) -> Result<(), ContainerStoreError> {
        let node = self.node(guid)?;
        node.run(&self.transformer).await?;
        tracing::info!(guid = %guid, "container-run-started");
        Ok(())
    }

    pub async fn stop(&self, guid: &str) -> Result<(), ContainerStoreError> {
        let node = self.node(guid)?;
        node.stop().await;
        tracing::info!(guid = %guid, "container-stop-requested");
        Ok(())
    }

    /// Tear a container down and forget it. The node stays registered when
    /// the backend refuses to destroy the container, so a later call can retry.
    pub async fn destroy(&self, guid: &str) -> Result<(), ContainerStoreError> {
        let node = self.node(guid)?;
        match node.destroy(self.backend.as_ref(), &self.dependencies).await {
            Err(err @ ContainerStoreError::Backend(_)) => Err(err),
            result => {
                self.nodes.remove(guid);
                tracing::info!(guid = %guid, "container-destroyed");
                result
            }
        }
    }

    pub fn get(&self, guid: &str) -> Result<ContainerSnapshot, ContainerStoreError> {
        Ok(self.node(guid)?.snapshot())
    }

    pub fn list(&self) -> Vec<ContainerSnapshot> {
        let mut snapshots: Vec<_> = self.nodes.list().iter().map(|n| n.snapshot()).collect();
        snapshots.sort_by(|a, b| a.guid.cmp(&b.guid));
        snapshots
    }

    /// Persist the dependency cache state.
    pub async fn cleanup(&self) {
        self.dependencies.stop().await;
    }

    pub fn new_container_reaper(&self) -> ContainerReaper {
        ContainerReaper::new(
            self.owner_name.clone(),
            self.settings.reap_interval(),
            Arc::clone(&self.backend),
            Arc::clone(&self.nodes) as Arc<dyn ContainerRegistry>,
        )
    }

    pub fn new_registry_pruner(&self) -> RegistryPruner {
        RegistryPruner::new(self.settings.reserved_expiration(), Arc::clone(&self.nodes))
    }
}
