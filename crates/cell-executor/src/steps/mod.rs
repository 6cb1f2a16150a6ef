// Step: the executable counterpart of an action node, plus its combinators.
//
// Every step runs to completion through `perform` and can be asked to stop
// early through `cancel`. Cancellation is cooperative: leaf steps observe a
// `CancellationToken`, combinators forward `cancel` to their children.

use async_trait::async_trait;
use cell_sdk::StringUtil;
use std::sync::Arc;
use std::time::Duration;

pub mod codependent;
pub mod download;
pub mod emit_progress;
pub mod long_running_monitor;
pub mod monitor;
pub mod output_wrapper;
pub mod parallel;
pub mod run;
pub mod serial;
pub mod timeout;
pub mod try_step;
pub mod upload;

pub use codependent::CodependentStep;
pub use download::DownloadStep;
pub use emit_progress::EmitProgressStep;
pub use long_running_monitor::LongRunningMonitorStep;
pub use monitor::{CheckFactory, MonitorStep};
pub use output_wrapper::OutputWrapperStep;
pub use parallel::ParallelStep;
pub use run::{NetworkInfo, RunStep};
pub use serial::SerialStep;
pub use timeout::TimeoutStep;
pub use try_step::TryStep;
pub use upload::UploadStep;

/// A unit of container work.
#[async_trait]
pub trait Step: Send + Sync {
    /// Run to completion, failure or cancellation.
    async fn perform(&self) -> Result<(), StepError>;

    /// Request early termination. Safe to call before, during or after `perform`.
    fn cancel(&self);
}

#[async_trait]
impl<S: Step + ?Sized> Step for Arc<S> {
    async fn perform(&self) -> Result<(), StepError> {
        (**self).perform().await
    }

    fn cancel(&self) {
        (**self).cancel()
    }
}

/// Errors produced by steps.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error("exceeded {} timeout", display_duration(.timeout))]
    TimedOut { timeout: Duration },

    /// A failure carrying a message meant for the container's log.
    #[error("{message}")]
    Emittable {
        message: String,
        wrapped: Option<String>,
    },

    /// Failures of concurrently run children.
    #[error("{}", display_aggregate(.0))]
    Aggregate(Vec<StepError>),

    #[error("codependent step exited")]
    CodependentExited,

    #[error("process did not exit")]
    ExitTimeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn emittable(message: impl Into<String>) -> Self {
        StepError::Emittable {
            message: message.into(),
            wrapped: None,
        }
    }

    pub fn emittable_wrapping(message: impl Into<String>, wrapped: &dyn std::fmt::Display) -> Self {
        StepError::Emittable {
            message: message.into(),
            wrapped: Some(wrapped.to_string()),
        }
    }

    /// True for a plain cancellation, or an aggregate made only of cancellations.
    pub fn is_cancelled(&self) -> bool {
        match self {
            StepError::Cancelled => true,
            StepError::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(StepError::is_cancelled)
            }
            _ => false,
        }
    }

    /// The user-facing message, when this error carries one.
    pub fn emittable_message(&self) -> Option<&str> {
        match self {
            StepError::Emittable { message, .. } => Some(message),
            _ => None,
        }
    }
}

fn display_duration(duration: &Duration) -> String {
    StringUtil::format_duration(*duration)
}

fn display_aggregate(errors: &[StepError]) -> String {
    let real: Vec<String> = errors
        .iter()
        .filter(|e| !matches!(e, StepError::Cancelled))
        .map(ToString::to_string)
        .collect();
    if real.is_empty() && !errors.is_empty() {
        return StepError::Cancelled.to_string();
    }
    real.join("; ")
}
