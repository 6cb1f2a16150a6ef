use async_trait::async_trait;
use futures::future::join_all;

use super::{Step, StepError};

/// Runs all children concurrently and waits for every one of them.
/// Fails with an aggregate of the children's failures.
pub struct ParallelStep {
    steps: Vec<Box<dyn Step>>,
}

impl ParallelStep {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Step for ParallelStep {
    async fn perform(&self) -> Result<(), StepError> {
        let results = join_all(self.steps.iter().map(|step| step.perform())).await;
        let errors: Vec<StepError> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StepError::Aggregate(errors))
        }
    }

    fn cancel(&self) {
        for step in &self.steps {
            step.cancel();
        }
    }
}
