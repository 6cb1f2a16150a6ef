use async_trait::async_trait;

use super::{Step, StepError};

/// Runs its child and reports success whatever the outcome.
pub struct TryStep {
    step: Box<dyn Step>,
}

impl TryStep {
    pub fn new(step: Box<dyn Step>) -> Self {
        Self { step }
    }
}

#[async_trait]
impl Step for TryStep {
    async fn perform(&self) -> Result<(), StepError> {
        if let Err(err) = self.step.perform().await {
            tracing::info!(error = %err, "try-step-failed-ignoring");
        }
        Ok(())
    }

    fn cancel(&self) {
        self.step.cancel();
    }
}
