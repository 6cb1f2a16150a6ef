// RegistryPruner: expires reservations that were never turned into containers.
//
// A reservation holds its guid in the registry until it is created. One that
// stays reserved past the expiration is completed as failed so it stops
// blocking the guid and is reported like any other finished container.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::node_map::NodeMap;

pub struct RegistryPruner {
    expiration: Duration,
    nodes: Arc<NodeMap>,
}

impl RegistryPruner {
    pub fn new(expiration: Duration, nodes: Arc<NodeMap>) -> Self {
        Self { expiration, nodes }
    }

    /// Time between passes: half the expiration, so a reservation outlives
    /// its expiration by at most half of it.
    pub fn interval(&self) -> Duration {
        (self.expiration / 2).max(Duration::from_millis(1))
    }

    /// Prune every `interval()` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = self.interval();
        tracing::info!(
            expiration_ms = self.expiration.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "registry-pruner-started"
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.prune();
                }
            }
        }

        tracing::info!("registry-pruner-stopped");
    }

    /// Run a single pass. Returns the guids that expired, sorted.
    pub fn prune(&self) -> Vec<String> {
        let expired = self.nodes.complete_expired(Instant::now(), self.expiration);
        for guid in &expired {
            tracing::info!(guid = %guid, "expired-reserved-container");
        }
        expired
    }
}
