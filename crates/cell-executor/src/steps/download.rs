use async_trait::async_trait;
use cell_common::constants::MAX_ERROR_MESSAGE_LEN;
use cell_sdk::{LogStreamer, RateLimiter, StringUtil};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Step, StepError};
use crate::action::DownloadAction;
use crate::cache::{CachedDownloader, ChecksumInfo};
use crate::container::{Container, StreamSpec};

/// Fetches an archive through the dependency cache and streams it into the container.
pub struct DownloadStep {
    container: Arc<dyn Container>,
    model: DownloadAction,
    cache: Arc<dyn CachedDownloader>,
    limiter: RateLimiter,
    streamer: LogStreamer,
    cancel: CancellationToken,
}

impl DownloadStep {
    pub fn new(
        container: Arc<dyn Container>,
        model: DownloadAction,
        cache: Arc<dyn CachedDownloader>,
        limiter: RateLimiter,
        streamer: LogStreamer,
    ) -> Self {
        Self {
            container,
            model,
            cache,
            limiter,
            streamer,
            cancel: CancellationToken::new(),
        }
    }

    fn emit(&self, message: &str) {
        if !self.model.artifact.is_empty() {
            self.streamer.stdout(message);
        }
    }

    fn cancelled_or(&self, err: StepError) -> StepError {
        if self.cancel.is_cancelled() {
            StepError::Cancelled
        } else {
            err
        }
    }
}

#[async_trait]
impl Step for DownloadStep {
    async fn perform(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let _permit = self
            .limiter
            .acquire_cancellable(&self.cancel)
            .await
            .map_err(|_| StepError::Cancelled)?;

        tracing::info!(from = %self.model.from, to = %self.model.to, "download-step-starting");
        self.emit(&format!("Downloading {}...", self.model.artifact));

        let url = Url::parse(&self.model.from).map_err(|e| {
            tracing::error!(from = %self.model.from, "Failed to parse download url: {}", e);
            self.emit(&format!("Downloading {} failed", self.model.artifact));
            StepError::emittable_wrapping("Downloading failed", &e)
        })?;

        let checksum = ChecksumInfo::new(
            self.model.checksum_algorithm.clone(),
            self.model.checksum_value.clone(),
        );
        let (stream, size) = self
            .cache
            .fetch(&url, &self.model.cache_key, &checksum, &self.cancel)
            .await
            .map_err(|e| {
                tracing::error!(cache_key = %self.model.cache_key, "Failed to fetch: {:#}", e);
                self.cancelled_or(StepError::emittable_wrapping("Downloading failed", &e))
            })?;

        let spec = StreamSpec {
            path: self.model.to.clone(),
            user: self.model.user.clone(),
        };
        let streamed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
            streamed = self.container.stream_in(spec, stream) => streamed,
        };
        if let Err(e) = streamed {
            tracing::error!(to = %self.model.to, "Failed to stream in: {:#}", e);
            let message = StringUtil::truncate_with_marker(
                &format!("Copying into the container failed: {e:#}"),
                MAX_ERROR_MESSAGE_LEN,
            );
            self.streamer.stderr(&message);
            return Err(StepError::emittable_wrapping(message, &e));
        }

        if size == 0 {
            self.emit(&format!("Downloaded {}", self.model.artifact));
        } else {
            self.emit(&format!(
                "Downloaded {} ({})",
                self.model.artifact,
                StringUtil::format_byte_size(size)
            ));
        }
        tracing::info!(to = %self.model.to, size, "download-step-finished");
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
