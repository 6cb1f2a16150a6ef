use async_trait::async_trait;
use std::time::Duration;

use super::{Step, StepError};

/// Cancels its child when it has not completed within `timeout`.
pub struct TimeoutStep {
    step: Box<dyn Step>,
    timeout: Duration,
}

impl TimeoutStep {
    pub fn new(step: Box<dyn Step>, timeout: Duration) -> Self {
        Self { step, timeout }
    }
}

#[async_trait]
impl Step for TimeoutStep {
    async fn perform(&self) -> Result<(), StepError> {
        let perform = self.step.perform();
        tokio::pin!(perform);

        tokio::select! {
            result = &mut perform => result,
            _ = tokio::time::sleep(self.timeout) => {
                tracing::info!(timeout_ms = self.timeout.as_millis() as u64, "timeout-step-timed-out");
                self.step.cancel();
                if let Err(err) = perform.await {
                    tracing::debug!(error = %err, "timeout-step-child-after-cancel");
                }
                Err(StepError::TimedOut {
                    timeout: self.timeout,
                })
            }
        }
    }

    fn cancel(&self) {
        self.step.cancel();
    }
}
