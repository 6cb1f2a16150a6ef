use async_trait::async_trait;

use super::{Step, StepError};

/// Runs children one after another, stopping at the first failure.
pub struct SerialStep {
    steps: Vec<Box<dyn Step>>,
}

impl SerialStep {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Step for SerialStep {
    async fn perform(&self) -> Result<(), StepError> {
        for step in &self.steps {
            step.perform().await?;
        }
        Ok(())
    }

    fn cancel(&self) {
        for step in &self.steps {
            step.cancel();
        }
    }
}
