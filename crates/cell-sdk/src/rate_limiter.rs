// RateLimiter: process-wide counting semaphore bounding concurrent downloads,
// uploads and health checks.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Errors returned while waiting for a slot.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateLimiterError {
    #[error("cancelled while waiting for a rate limiter slot")]
    Cancelled,

    #[error("rate limiter closed")]
    Closed,
}

/// A cloneable counting semaphore.
///
/// Clones share the same slots. A slot is held by the returned permit and
/// released when the permit is dropped, on success and failure alike.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl RateLimiter {
    /// Create a limiter admitting at most `capacity` concurrent holders.
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Maximum number of concurrent holders.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, RateLimiterError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RateLimiterError::Closed)
    }

    /// Wait for a slot, giving up when `cancel` fires first.
    pub async fn acquire_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, RateLimiterError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RateLimiterError::Cancelled),
            permit = self.acquire() => permit,
        }
    }
}
