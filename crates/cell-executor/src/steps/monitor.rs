use async_trait::async_trait;
use cell_sdk::{LogStreamer, RateLimiter, StringUtil};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Step, StepError};
use crate::started_signal::StartedSignal;

/// Builds a fresh step for every health check.
pub type CheckFactory = Arc<dyn Fn() -> Box<dyn Step> + Send + Sync>;

/// Repeatedly runs a health check.
///
/// Checks run every `unhealthy_interval` until the first success, which fires
/// the started signal, and every `healthy_interval` afterwards. A failed check
/// after the container became healthy ends the monitor with that check's
/// error. With a non-zero `start_timeout`, the monitor also ends once the
/// timeout elapses without any success, cancelling a check still in flight.
pub struct MonitorStep {
    factory: CheckFactory,
    started: Arc<StartedSignal>,
    streamer: LogStreamer,
    start_timeout: Duration,
    healthy_interval: Duration,
    unhealthy_interval: Duration,
    work_pool: RateLimiter,
    cancel: CancellationToken,
}

impl MonitorStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: CheckFactory,
        started: Arc<StartedSignal>,
        streamer: LogStreamer,
        start_timeout: Duration,
        healthy_interval: Duration,
        unhealthy_interval: Duration,
        work_pool: RateLimiter,
    ) -> Self {
        Self {
            factory,
            started,
            streamer,
            start_timeout,
            healthy_interval,
            unhealthy_interval,
            work_pool,
            cancel: CancellationToken::new(),
        }
    }

    /// Run one check under the health-check work pool. A check still running
    /// at `deadline` is cancelled and reported as a start timeout.
    async fn check(&self, deadline: Option<Instant>) -> Result<(), StepError> {
        let _permit = self
            .work_pool
            .acquire_cancellable(&self.cancel)
            .await
            .map_err(|_| StepError::Cancelled)?;

        let check = (self.factory)();
        let perform = check.perform();
        tokio::pin!(perform);

        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                check.cancel();
                if let Err(err) = perform.await {
                    tracing::debug!(error = %err, "monitor-check-after-cancel");
                }
                Err(StepError::Cancelled)
            }
            result = &mut perform => result,
            _ = expired => {
                check.cancel();
                if let Err(err) = perform.await {
                    tracing::debug!(error = %err, "monitor-check-after-start-timeout");
                }
                Err(StepError::TimedOut {
                    timeout: self.start_timeout,
                })
            }
        }
    }

    fn report_start_timeout(&self, err: &StepError) {
        tracing::info!(error = %err, "monitor-timed-out-before-healthy");
        self.streamer.stderr(&format!(
            "Timed out after {}: health check never passed.",
            StringUtil::format_duration(self.start_timeout)
        ));
    }
}

#[async_trait]
impl Step for MonitorStep {
    async fn perform(&self) -> Result<(), StepError> {
        self.streamer
            .stdout("Starting health monitoring of container");

        let started_at = Instant::now();
        let mut healthy = false;

        loop {
            let interval = if healthy {
                self.healthy_interval
            } else {
                self.unhealthy_interval
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }

            let deadline = (!healthy && !self.start_timeout.is_zero())
                .then(|| started_at + self.start_timeout);

            match self.check(deadline).await {
                Ok(()) => {
                    if !healthy {
                        healthy = true;
                        tracing::info!("monitor-transitioned-to-healthy");
                        self.streamer.stdout("Container became healthy");
                        self.started.fire();
                    }
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    if healthy {
                        tracing::info!(error = %err, "monitor-transitioned-to-unhealthy");
                        self.streamer.stdout("Container became unhealthy");
                        return Err(err);
                    }

                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        self.report_start_timeout(&err);
                        return Err(err);
                    }

                    tracing::debug!(error = %err, "monitor-check-failed-still-starting");
                }
            }
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeStep;
    use cell_sdk::CollectingLogSink;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HEALTHY: Duration = Duration::from_secs(30);
    const UNHEALTHY: Duration = Duration::from_millis(500);

    /// Checks that fail or succeed in the given order, then keep succeeding.
    fn scripted_checks(script: &[bool]) -> (CheckFactory, Arc<AtomicUsize>) {
        let script = Arc::new(Mutex::new(script.iter().copied().collect::<VecDeque<_>>()));
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let factory: CheckFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            match script.lock().pop_front() {
                Some(false) => Box::new(FakeStep::failing("check", "unhealthy")) as Box<dyn Step>,
                _ => Box::new(FakeStep::succeeding("check")),
            }
        });
        (factory, built)
    }

    fn always_failing() -> CheckFactory {
        Arc::new(|| Box::new(FakeStep::failing("check", "unhealthy")) as Box<dyn Step>)
    }

    fn monitor(
        factory: CheckFactory,
        start_timeout: Duration,
    ) -> (Arc<MonitorStep>, Arc<StartedSignal>, Arc<CollectingLogSink>) {
        let (started, _rx) = StartedSignal::channel();
        let sink = Arc::new(CollectingLogSink::new());
        let step = Arc::new(MonitorStep::new(
            factory,
            started.clone(),
            LogStreamer::new(sink.clone(), "HEALTH"),
            start_timeout,
            HEALTHY,
            UNHEALTHY,
            RateLimiter::new(4),
        ));
        (step, started, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_started_once_on_first_success() {
        let (factory, built) = scripted_checks(&[false, false, true, true, true]);
        let (step, started, sink) = monitor(factory, Duration::ZERO);

        let task = {
            let step = step.clone();
            tokio::spawn(async move { step.perform().await })
        };

        // Three unhealthy-interval checks reach the first success.
        tokio::time::sleep(UNHEALTHY * 3 + Duration::from_millis(10)).await;
        assert!(started.has_fired());

        // Two more successful checks on the healthy interval.
        tokio::time::sleep(HEALTHY * 2).await;
        assert_eq!(built.load(Ordering::SeqCst), 5);
        assert!(!started.fire(), "signal must already have fired");

        let healthy_lines = sink
            .stdout_lines()
            .into_iter()
            .filter(|l| l == "Container became healthy")
            .count();
        assert_eq!(healthy_lines, 1);
        assert_eq!(sink.stdout_lines()[0], "Starting health monitoring of container");

        step.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn fails_without_firing_when_start_timeout_elapses() {
        let (step, started, sink) = monitor(always_failing(), Duration::from_secs(2));

        let err = step.perform().await.unwrap_err();

        assert_eq!(err.to_string(), "unhealthy");
        assert!(!started.has_fired());
        assert_eq!(
            sink.stderr_lines(),
            vec!["Timed out after 2s: health check never passed."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_start_timeout_keeps_checking() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let factory: CheckFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(FakeStep::failing("check", "unhealthy")) as Box<dyn Step>
        });
        let (step, started, _sink) = monitor(factory, Duration::ZERO);

        let task = {
            let step = step.clone();
            tokio::spawn(async move { step.perform().await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(built.load(Ordering::SeqCst) >= 100);
        assert!(!task.is_finished());
        assert!(!started.has_fired());

        step.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_healthy_ends_the_monitor() {
        let (factory, _built) = scripted_checks(&[true, false]);
        let (step, started, sink) = monitor(factory, Duration::from_secs(1));

        let err = step.perform().await.unwrap_err();

        assert_eq!(err.to_string(), "unhealthy");
        assert!(started.has_fired());
        assert_eq!(
            sink.stdout_lines(),
            vec![
                "Starting health monitoring of container",
                "Container became healthy",
                "Container became unhealthy",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_an_in_flight_check() {
        let check = Arc::new(FakeStep::blocking("check"));
        let factory: CheckFactory = {
            let check = check.clone();
            Arc::new(move || Box::new(check.clone()) as Box<dyn Step>)
        };
        let (step, _started, _sink) = monitor(factory, Duration::ZERO);

        let task = {
            let step = step.clone();
            tokio::spawn(async move { step.perform().await })
        };
        tokio::time::sleep(UNHEALTHY + Duration::from_millis(10)).await;
        assert_eq!(check.performs(), 1);

        step.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(check.cancels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_timeout_cancels_a_hung_check() {
        let check = Arc::new(FakeStep::blocking("check"));
        let factory: CheckFactory = {
            let check = check.clone();
            Arc::new(move || Box::new(check.clone()) as Box<dyn Step>)
        };
        let (step, started, sink) = monitor(factory, Duration::from_secs(2));
        let begun = Instant::now();

        let err = tokio::time::timeout(Duration::from_secs(10), step.perform())
            .await
            .expect("a hung check must not outlive the start timeout")
            .unwrap_err();

        assert!(matches!(err, StepError::TimedOut { timeout } if timeout == Duration::from_secs(2)));
        assert!(begun.elapsed() >= Duration::from_secs(2));
        assert_eq!(check.performs(), 1);
        assert_eq!(check.cancels(), 1);
        assert!(!started.has_fired());
        assert_eq!(
            sink.stderr_lines(),
            vec!["Timed out after 2s: health check never passed."]
        );
    }
}
