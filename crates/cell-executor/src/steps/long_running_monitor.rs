use async_trait::async_trait;
use cell_sdk::{LogStreamer, StringUtil};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Step, StepError};
use crate::started_signal::StartedSignal;

/// Supervises a container through long-lived health-check processes.
///
/// The readiness check runs once and returns when the container is healthy
/// or when it gives up. Success fires the started signal and starts the
/// liveness check, which runs until the container stops being healthy.
/// Check output goes to `health_streamer`; lifecycle lines go to `streamer`.
pub struct LongRunningMonitorStep {
    readiness: Box<dyn Step>,
    liveness: Box<dyn Step>,
    started: Arc<StartedSignal>,
    streamer: LogStreamer,
    health_streamer: LogStreamer,
    start_timeout: Duration,
    cancel: CancellationToken,
}

impl LongRunningMonitorStep {
    pub fn new(
        readiness: Box<dyn Step>,
        liveness: Box<dyn Step>,
        started: Arc<StartedSignal>,
        streamer: LogStreamer,
        health_streamer: LogStreamer,
        start_timeout: Duration,
    ) -> Self {
        Self {
            readiness,
            liveness,
            started,
            streamer,
            health_streamer,
            start_timeout,
            cancel: CancellationToken::new(),
        }
    }

    async fn run_check(&self, check: &dyn Step) -> Result<(), StepError> {
        let perform = check.perform();
        tokio::pin!(perform);

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                check.cancel();
                if let Err(err) = perform.await {
                    tracing::debug!(error = %err, "long-running-monitor-check-after-cancel");
                }
                Err(StepError::Cancelled)
            }
            result = &mut perform => result,
        }
    }
}

#[async_trait]
impl Step for LongRunningMonitorStep {
    async fn perform(&self) -> Result<(), StepError> {
        self.streamer
            .stdout("Starting health monitoring of container");

        match self.run_check(self.readiness.as_ref()).await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => return Err(StepError::Cancelled),
            Err(err) => {
                tracing::info!(error = %err, "long-running-monitor-timed-out-before-healthy");
                self.health_streamer.stderr(&err.to_string());
                let message = format!(
                    "Timed out after {}: health check never passed.",
                    StringUtil::format_duration(self.start_timeout)
                );
                self.streamer.stderr(&message);
                return Err(StepError::emittable_wrapping(message, &err));
            }
        }

        tracing::info!("long-running-monitor-transitioned-to-healthy");
        self.streamer.stdout("Container became healthy");
        self.started.fire();

        match self.run_check(self.liveness.as_ref()).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Err(StepError::Cancelled),
            Err(err) => {
                tracing::info!(error = %err, "long-running-monitor-transitioned-to-unhealthy");
                self.streamer.stdout("Container became unhealthy");
                self.health_streamer.stderr(&err.to_string());
                Err(StepError::emittable_wrapping(
                    format!("Instance became unhealthy: {err}"),
                    &err,
                ))
            }
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
