use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use super::{Step, StepError};

/// Runs all children concurrently as one unit of liveness.
///
/// The first child to fail cancels the rest. With `error_on_exit`, a child
/// that exits cleanly does the same and contributes
/// [`StepError::CodependentExited`]. The step returns once every child has
/// returned.
pub struct CodependentStep {
    steps: Vec<Box<dyn Step>>,
    error_on_exit: bool,
}

impl CodependentStep {
    pub fn new(steps: Vec<Box<dyn Step>>, error_on_exit: bool) -> Self {
        Self {
            steps,
            error_on_exit,
        }
    }
}

#[async_trait]
impl Step for CodependentStep {
    async fn perform(&self) -> Result<(), StepError> {
        let mut pending: FuturesUnordered<_> =
            self.steps.iter().map(|step| step.perform()).collect();

        let mut errors = Vec::new();
        let mut cancelled = false;

        while let Some(result) = pending.next().await {
            let error = match result {
                Err(err) => err,
                Ok(()) if self.error_on_exit => StepError::CodependentExited,
                Ok(()) => continue,
            };
            if !cancelled {
                tracing::debug!(error = %error, "codependent-child-exited, cancelling siblings");
                cancelled = true;
                self.cancel();
            }
            errors.push(error);
        }

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
