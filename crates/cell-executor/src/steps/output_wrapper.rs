use async_trait::async_trait;
use cell_sdk::CollectingLogSink;
use std::sync::Arc;

use super::{Step, StepError};

/// Turns a failing child's buffered output into its error message.
///
/// Used for health checks, where a check's own output explains
/// why the container is unhealthy.
pub struct OutputWrapperStep {
    step: Box<dyn Step>,
    buffer: Arc<CollectingLogSink>,
}

impl OutputWrapperStep {
    pub fn new(step: Box<dyn Step>, buffer: Arc<CollectingLogSink>) -> Self {
        Self { step, buffer }
    }
}

#[async_trait]
impl Step for OutputWrapperStep {
    async fn perform(&self) -> Result<(), StepError> {
        match self.step.perform().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                let output = self.buffer.text();
                let output = output.trim();
                if output.is_empty() {
                    Err(err)
                } else {
                    Err(StepError::emittable_wrapping(output, &err))
                }
            }
        }
    }

    fn cancel(&self) {
        self.step.cancel();
    }
}
