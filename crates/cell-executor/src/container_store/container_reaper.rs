// ContainerReaper: periodic reconciliation between the registry and the backend.
//
// Each pass lists the backend containers tagged with this executor's owner
// property, destroys the ones the registry does not know about, and completes
// tracked containers whose backend container has disappeared.

use cell_common::constants::OWNER_PROPERTY;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::node_map::ContainerRegistry;
use crate::container::ContainerBackend;

/// What one reap pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Untracked backend containers that were destroyed.
    pub destroyed: Vec<String>,
    /// Tracked containers completed because their backend container is gone.
    pub missing: Vec<String>,
}

pub struct ContainerReaper {
    owner_name: String,
    interval: Duration,
    backend: Arc<dyn ContainerBackend>,
    registry: Arc<dyn ContainerRegistry>,
}

impl ContainerReaper {
    pub fn new(
        owner_name: impl Into<String>,
        interval: Duration,
        backend: Arc<dyn ContainerBackend>,
        registry: Arc<dyn ContainerRegistry>,
    ) -> Self {
        Self {
            owner_name: owner_name.into(),
            interval,
            backend,
            registry,
        }
    }

    /// Reap every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            owner = %self.owner_name,
            interval_ms = self.interval.as_millis() as u64,
            "container-reaper-started"
        );

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap().await {
                        tracing::error!("Failed to reap containers: {:#}", e);
                    }
                }
            }
        }

        tracing::info!(owner = %self.owner_name, "container-reaper-stopped");
    }

    /// Run a single reconciliation pass.
    ///
    /// A failed listing aborts the pass. A failed destroy is logged and the
    /// handle is retried on the next pass.
    pub async fn reap(&self) -> anyhow::Result<ReapReport> {
        let filter = HashMap::from([(OWNER_PROPERTY.to_string(), self.owner_name.clone())]);
        let observed: HashSet<String> = self.backend.list(&filter).await?.into_iter().collect();

        let mut report = ReapReport::default();
        for handle in &observed {
            if self.registry.contains(handle) {
                continue;
            }
            tracing::info!(handle = %handle, "reaping-extra-container");
            match self.backend.destroy(handle).await {
                Ok(()) => report.destroyed.push(handle.clone()),
                Err(e) => tracing::error!(handle = %handle, "Failed to destroy extra container: {:#}", e),
            }
        }

        report.missing = self.registry.complete_missing(&observed);
        for handle in &report.missing {
            tracing::info!(handle = %handle, "reaped-missing-container");
        }

        report.destroyed.sort();
        report.missing.sort();
        Ok(report)
    }
}
