// NodeMap: guid -> store node registry shared by the store and the reaper.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::store_node::StoreNode;
use super::ContainerStoreError;

/// The reaper's view of the registry.
pub trait ContainerRegistry: Send + Sync {
    /// Whether a container with this handle is tracked.
    fn contains(&self, handle: &str) -> bool;

    /// Complete every created or running container whose handle is not in
    /// `observed`. Returns the handles that were completed.
    fn complete_missing(&self, observed: &HashSet<String>) -> Vec<String>;
}

#[derive(Default)]
pub struct NodeMap {
    nodes: DashMap<String, Arc<StoreNode>>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, node: Arc<StoreNode>) -> Result<(), ContainerStoreError> {
        match self.nodes.entry(node.guid().to_string()) {
            Entry::Occupied(_) => Err(ContainerStoreError::AlreadyExists(node.guid().to_string())),
            Entry::Vacant(slot) => {
                slot.insert(node);
                Ok(())
            }
        }
    }

    pub fn get(&self, guid: &str) -> Option<Arc<StoreNode>> {
        self.nodes.get(guid).map(|n| Arc::clone(n.value()))
    }

    pub fn remove(&self, guid: &str) -> Option<Arc<StoreNode>> {
        self.nodes.remove(guid).map(|(_, node)| node)
    }

    pub fn list(&self) -> Vec<Arc<StoreNode>> {
        self.nodes.iter().map(|n| Arc::clone(n.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Complete every node reserved for at least `expiration` as of `now`.
    /// Returns the guids that were completed, sorted.
    pub fn complete_expired(&self, now: Instant, expiration: Duration) -> Vec<String> {
        let mut expired: Vec<String> = self
            .list()
            .into_iter()
            .filter(|node| node.expire(now, expiration))
            .map(|node| node.guid().to_string())
            .collect();
        expired.sort();
        expired
    }
}

impl ContainerRegistry for NodeMap {
    fn contains(&self, handle: &str) -> bool {
        self.nodes.contains_key(handle)
    }

    fn complete_missing(&self, observed: &HashSet<String>) -> Vec<String> {
        // Snapshot first so no shard lock is held while nodes are completed.
        let nodes = self.list();
        nodes
            .into_iter()
            .filter(|node| !observed.contains(node.guid()))
            .filter(|node| node.reap())
            .map(|node| node.guid().to_string())
            .collect()
    }
}
