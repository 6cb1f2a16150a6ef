// StepRunner: supervises the root step of one container.

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::steps::{Step, StepError};

/// The runnable produced for one container.
///
/// `ready` is notified once the container counts as started: immediately
/// for unmonitored containers, on the first passing health check otherwise.
pub struct StepRunner {
    step: Box<dyn Step>,
    started: oneshot::Receiver<()>,
}

impl StepRunner {
    pub fn new(step: Box<dyn Step>, started: oneshot::Receiver<()>) -> Self {
        Self { step, started }
    }

    /// Perform the root step until it returns. Cancelling `shutdown` cancels
    /// the root step once; the step's own result is still returned.
    pub async fn run(
        self,
        shutdown: CancellationToken,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<(), StepError> {
        let Self { step, mut started } = self;
        let mut ready = ready;
        let mut cancelled = false;

        let perform = step.perform();
        tokio::pin!(perform);

        loop {
            tokio::select! {
                biased;
                fired = &mut started, if ready.is_some() => {
                    if let (Ok(()), Some(tx)) = (fired, ready.take()) {
                        tracing::debug!("step-runner-ready");
                        let _ = tx.send(());
                    }
                }
                result = &mut perform => {
                    // The signal can fire in the same poll that finishes the step.
                    if let Some(tx) = ready.take() {
                        if started.try_recv().is_ok() {
                            tracing::debug!("step-runner-ready");
                            let _ = tx.send(());
                        }
                    }
                    match &result {
                        Ok(()) => tracing::info!("step-runner-finished"),
                        Err(err) if err.is_cancelled() => tracing::info!("step-runner-cancelled"),
                        Err(err) => tracing::info!(error = %err, "step-runner-failed"),
                    }
                    return result;
                }
                _ = shutdown.cancelled(), if !cancelled => {
                    cancelled = true;
                    tracing::info!("step-runner-signalled");
                    step.cancel();
                }
            }
        }
    }
}
