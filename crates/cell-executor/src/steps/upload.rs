use async_trait::async_trait;
use cell_sdk::{LogStreamer, RateLimiter, StringUtil};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Step, StepError};
use crate::action::UploadAction;
use crate::cache::Uploader;
use crate::container::{Container, StreamSpec};

/// Message used when the container refuses to stream the requested path.
pub const ESTABLISH_STREAM_FAILED: &str = "Failed to establish stream from container";

/// Streams a path out of the container and uploads it.
pub struct UploadStep {
    container: Arc<dyn Container>,
    model: UploadAction,
    uploader: Arc<dyn Uploader>,
    limiter: RateLimiter,
    streamer: LogStreamer,
    cancel: CancellationToken,
}

impl UploadStep {
    pub fn new(
        container: Arc<dyn Container>,
        model: UploadAction,
        uploader: Arc<dyn Uploader>,
        limiter: RateLimiter,
        streamer: LogStreamer,
    ) -> Self {
        Self {
            container,
            model,
            uploader,
            limiter,
            streamer,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Step for UploadStep {
    async fn perform(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        tracing::info!(from = %self.model.from, "upload-step-starting");

        let url = Url::parse(&self.model.to).map_err(|e| {
            tracing::error!(to = %self.model.to, "Failed to parse upload url: {}", e);
            StepError::Other(anyhow::Error::new(e).context("invalid upload url"))
        })?;

        let _permit = self
            .limiter
            .acquire_cancellable(&self.cancel)
            .await
            .map_err(|_| StepError::Cancelled)?;

        let spec = StreamSpec {
            path: self.model.from.clone(),
            user: self.model.user.clone(),
        };
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
            result = self.container.stream_out(spec) => result.map_err(|e| {
                tracing::error!(from = %self.model.from, "Failed to stream out: {:#}", e);
                StepError::emittable_wrapping(ESTABLISH_STREAM_FAILED, &e)
            })?,
        };

        let uploaded = self
            .uploader
            .upload(stream, &url, &self.cancel)
            .await
            .map_err(|e| {
                if self.cancel.is_cancelled() {
                    return StepError::Cancelled;
                }
                tracing::error!(to = %url, "Failed to upload: {:#}", e);
                StepError::Other(e)
            })?;

        if !self.model.artifact.is_empty() {
            self.streamer.stdout(&format!(
                "Uploaded {} ({})",
                self.model.artifact,
                StringUtil::format_byte_size(uploaded)
            ));
        }
        tracing::info!(to = %url, size = uploaded, "upload-step-finished");
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
