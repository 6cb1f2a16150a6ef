// StoreNode: one tracked container and its lifecycle
// (reserve -> create -> run -> stop/destroy).

use cell_common::constants::{FailureReason, OWNER_PROPERTY};
use cell_sdk::LogStreamer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::ContainerStoreError;
use crate::container::{BackendContainerSpec, Container, ContainerBackend, ContainerSpec};
use crate::dependency_manager::{CacheKeyDir, DependencyManager};
use crate::transformer::Transformer;

/// Lifecycle state of a tracked container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerState {
    Reserved,
    Created,
    Running,
    Completed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::Reserved => "reserved",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Outcome recorded when a container completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub failed: bool,
    pub failure_reason: String,
    /// Set once a stop was requested.
    pub stopped: bool,
}

/// Point-in-time copy of a node's public state. Also published on the
/// store's event channel at every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub guid: String,
    pub state: ContainerState,
    pub run_result: RunResult,
}

struct RunningProcess {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct NodeInfo {
    state: ContainerState,
    run_result: RunResult,
    container: Option<Arc<dyn Container>>,
    cache_keys: Vec<CacheKeyDir>,
}

pub struct StoreNode {
    spec: ContainerSpec,
    streamer: LogStreamer,
    events: broadcast::Sender<ContainerSnapshot>,
    reserved_at: Instant,
    info: Mutex<NodeInfo>,
    process: Mutex<Option<RunningProcess>>,
    /// Serializes lifecycle operations on this node.
    op_lock: tokio::sync::Mutex<()>,
}

impl StoreNode {
    pub fn new(
        spec: ContainerSpec,
        streamer: LogStreamer,
        events: broadcast::Sender<ContainerSnapshot>,
    ) -> Self {
        Self {
            spec,
            streamer,
            events,
            reserved_at: Instant::now(),
            info: Mutex::new(NodeInfo {
                state: ContainerState::Reserved,
                run_result: RunResult::default(),
                container: None,
                cache_keys: Vec::new(),
            }),
            process: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn guid(&self) -> &str {
        &self.spec.guid
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        self.snapshot_of(&self.info.lock())
    }

    fn snapshot_of(&self, info: &NodeInfo) -> ContainerSnapshot {
        ContainerSnapshot {
            guid: self.spec.guid.clone(),
            state: info.state,
            run_result: info.run_result.clone(),
        }
    }

    /// Publish the current state. Sending fails only when nobody subscribed.
    fn publish(&self, info: &NodeInfo) {
        let _ = self.events.send(self.snapshot_of(info));
    }

    /// Publish the initial reserved state once the node is registered.
    pub(super) fn announce(&self) {
        self.publish(&self.info.lock());
    }

    pub fn state(&self) -> ContainerState {
        self.info.lock().state
    }

    /// Transition to `Completed`. Returns `false` if the node had already completed.
    pub fn complete(&self, failed: bool, failure_reason: &str) -> bool {
        self.complete_locked(&mut self.info.lock(), failed, failure_reason)
    }

    fn complete_locked(&self, info: &mut NodeInfo, failed: bool, failure_reason: &str) -> bool {
        if info.state == ContainerState::Completed {
            return false;
        }
        tracing::debug!(guid = %self.spec.guid, failed, reason = failure_reason, "node-complete");
        info.state = ContainerState::Completed;
        info.run_result.failed = failed;
        info.run_result.failure_reason = failure_reason.to_string();
        self.publish(info);
        true
    }

    /// Mark the node completed because its backend container vanished.
    pub fn reap(&self) -> bool {
        let mut info = self.info.lock();
        if !matches!(info.state, ContainerState::Created | ContainerState::Running) {
            return false;
        }
        self.complete_locked(&mut info, true, FailureReason::MissingContainer.as_str())
    }

    /// Complete a node that has stayed reserved for at least `expiration`.
    /// Nodes with a lifecycle operation in flight are left alone.
    pub fn expire(&self, now: Instant, expiration: Duration) -> bool {
        let Ok(_op) = self.op_lock.try_lock() else {
            return false;
        };
        let mut info = self.info.lock();
        if info.state != ContainerState::Reserved
            || now.saturating_duration_since(self.reserved_at) < expiration
        {
            return false;
        }
        self.complete_locked(&mut info, true, FailureReason::ReservationExpired.as_str())
    }

    fn mark_running(&self) {
        let mut info = self.info.lock();
        if info.state == ContainerState::Created {
            info.state = ContainerState::Running;
            tracing::info!(guid = %self.spec.guid, "container-running");
            self.publish(&info);
        }
    }

    fn invalid_transition(&self, to: ContainerState) -> ContainerStoreError {
        ContainerStoreError::InvalidTransition {
            guid: self.spec.guid.clone(),
            from: self.state(),
            to,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Download dependencies and create the backend container.
    pub async fn create(
        &self,
        backend: &dyn ContainerBackend,
        dependencies: &DependencyManager,
        owner_name: &str,
    ) -> Result<(), ContainerStoreError> {
        let _op = self.op_lock.lock().await;
        if self.state() != ContainerState::Reserved {
            return Err(self.invalid_transition(ContainerState::Created));
        }

        let mounts = match dependencies
            .download_cached_dependencies(&self.spec.cached_dependencies, &self.streamer)
            .await
        {
            Ok(mounts) => mounts,
            Err(err) => {
                self.complete(true, FailureReason::DependencyDownloadFailed.as_str());
                return Err(ContainerStoreError::Dependency(err));
            }
        };
        let (cache_keys, bind_mounts) = mounts.into_parts();
        self.info.lock().cache_keys = cache_keys;

        let spec = BackendContainerSpec {
            handle: self.spec.guid.clone(),
            bind_mounts,
            env: self
                .spec
                .env
                .iter()
                .map(|e| format!("{}={}", e.name, e.value))
                .collect(),
            properties: HashMap::from([(OWNER_PROPERTY.to_string(), owner_name.to_string())]),
        };

        self.streamer.stdout("Creating container");
        let container = match backend.create(spec).await {
            Ok(container) => container,
            Err(e) => {
                tracing::error!(guid = %self.spec.guid, "Failed to create container: {:#}", e);
                self.streamer.stderr("Failed to create container");
                self.complete(true, FailureReason::ContainerCreationFailed.as_str());
                return Err(ContainerStoreError::Backend(e));
            }
        };
        self.streamer.stdout("Successfully created container");

        let mut info = self.info.lock();
        info.container = Some(container);
        info.state = ContainerState::Created;
        self.publish(&info);
        Ok(())
    }

    /// Compile the container's actions and start running them in the background.
    pub async fn run(self: &Arc<Self>, transformer: &Transformer) -> Result<(), ContainerStoreError> {
        let _op = self.op_lock.lock().await;
        let container = {
            let info = self.info.lock();
            match (&info.state, &info.container) {
                (ContainerState::Created, Some(container)) => Arc::clone(container),
                _ => {
                    drop(info);
                    return Err(self.invalid_transition(ContainerState::Running));
                }
            }
        };

        let runner = transformer.steps_runner(&self.spec, container, &self.streamer)?;

        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let node = Arc::clone(self);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            // Joined so a container that became ready is marked running
            // before its completion is recorded.
            let mark_running = async {
                if ready_rx.await.is_ok() {
                    node.mark_running();
                }
            };
            let (result, ()) = tokio::join!(runner.run(token, Some(ready_tx)), mark_running);
            match result {
                Ok(()) => node.complete(false, ""),
                Err(err) => node.complete(true, &err.to_string()),
            };
        });

        *self.process.lock() = Some(RunningProcess { shutdown, handle });
        Ok(())
    }

    /// Signal a running node to stop, or complete a node that never ran.
    pub async fn stop(&self) {
        let _op = self.op_lock.lock().await;
        self.stop_locked();
    }

    fn stop_locked(&self) {
        self.info.lock().run_result.stopped = true;
        match self.process.lock().as_ref() {
            Some(process) => {
                process.shutdown.cancel();
                tracing::debug!(guid = %self.spec.guid, "signaled-process");
            }
            None => {
                self.complete(true, FailureReason::StoppedBeforeRunning.as_str());
            }
        }
    }

    /// Stop, wait for the runner, destroy the backend container and release
    /// cached dependencies.
    pub async fn destroy(
        &self,
        backend: &dyn ContainerBackend,
        dependencies: &DependencyManager,
    ) -> Result<(), ContainerStoreError> {
        let _op = self.op_lock.lock().await;
        self.stop_locked();

        let process = self.process.lock().take();
        if let Some(process) = process {
            if let Err(e) = process.handle.await {
                tracing::error!(guid = %self.spec.guid, "Container runner task failed: {}", e);
            }
        }

        let has_container = self.info.lock().container.is_some();
        if has_container {
            self.streamer.stdout("Destroying container");
            if let Err(e) = backend.destroy(&self.spec.guid).await {
                tracing::error!(guid = %self.spec.guid, "Failed to destroy container: {:#}", e);
                self.streamer.stderr("Failed to destroy container");
                return Err(ContainerStoreError::Backend(e));
            }
            self.streamer.stdout("Successfully destroyed container");
        }

        let cache_keys = std::mem::take(&mut self.info.lock().cache_keys);
        if let Err(err) = dependencies.release_cached_dependencies(&cache_keys).await {
            tracing::error!(guid = %self.spec.guid, "Failed to release cached dependencies: {}", err);
            return Err(ContainerStoreError::BindMountCleanupFailed(err));
        }
        Ok(())
    }
}
