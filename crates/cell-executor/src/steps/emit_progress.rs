use async_trait::async_trait;
use cell_sdk::LogStreamer;

use super::{Step, StepError};

/// Wraps a child with start, success and failure lines on the container log.
pub struct EmitProgressStep {
    step: Box<dyn Step>,
    start_message: String,
    success_message: String,
    failure_message_prefix: String,
    streamer: LogStreamer,
}

impl EmitProgressStep {
    pub fn new(
        step: Box<dyn Step>,
        start_message: impl Into<String>,
        success_message: impl Into<String>,
        failure_message_prefix: impl Into<String>,
        streamer: LogStreamer,
    ) -> Self {
        Self {
            step,
            start_message: start_message.into(),
            success_message: success_message.into(),
            failure_message_prefix: failure_message_prefix.into(),
            streamer,
        }
    }
}

#[async_trait]
impl Step for EmitProgressStep {
    async fn perform(&self) -> Result<(), StepError> {
        if !self.start_message.is_empty() {
            self.streamer.stdout(&self.start_message);
        }

        match self.step.perform().await {
            Ok(()) => {
                if !self.success_message.is_empty() {
                    self.streamer.stdout(&self.success_message);
                }
                Ok(())
            }
            Err(err) => {
                tracing::info!(error = %err, "emit-progress-step-failed");
                if !self.failure_message_prefix.is_empty() {
                    let line = match err.emittable_message() {
                        Some(message) => format!("{}: {}", self.failure_message_prefix, message),
                        None => self.failure_message_prefix.clone(),
                    };
                    self.streamer.stderr(&line);
                }
                Err(err)
            }
        }
    }

    fn cancel(&self) {
        self.step.cancel();
    }
}
