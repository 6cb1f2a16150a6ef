// Transformer: compiles a container's action trees into a runnable step graph.

use cell_common::constants::{
    DEFAULT_HEALTH_CHECK_REQUEST_TIMEOUT_MS, HEALTH_CHECK_NOFILE, HEALTH_CHECK_USER, HEALTH_LOG_SOURCE,
};
use cell_common::ExecutorSettings;
use cell_sdk::{CollectingLogSink, LogStreamer, RateLimiter, StringUtil};
use std::sync::Arc;
use std::time::Duration;

use crate::action::{Action, RunAction};
use crate::cache::{CachedDownloader, Uploader};
use crate::container::{Check, CheckDefinition, Container, ContainerSpec};
use crate::started_signal::StartedSignal;
use crate::step_runner::StepRunner;
use crate::steps::{
    CheckFactory, CodependentStep, DownloadStep, EmitProgressStep, LongRunningMonitorStep, MonitorStep,
    NetworkInfo, OutputWrapperStep, ParallelStep, RunStep, SerialStep, Step, TimeoutStep, TryStep,
    UploadStep,
};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("container {guid} cannot have an empty action")]
    MissingAction { guid: String },
}

/// Everything a step needs to know about the container it runs in.
#[derive(Clone)]
pub struct StepContext {
    pub container: Arc<dyn Container>,
    pub streamer: LogStreamer,
    pub network: NetworkInfo,
    /// Set while compiling a health check.
    pub health_check: bool,
}

impl StepContext {
    pub fn new(container: Arc<dyn Container>, streamer: LogStreamer, network: NetworkInfo) -> Self {
        Self {
            container,
            streamer,
            network,
            health_check: false,
        }
    }

    fn with_streamer(&self, streamer: LogStreamer) -> Self {
        Self {
            streamer,
            ..self.clone()
        }
    }

    fn for_health_check(&self) -> Self {
        Self {
            health_check: true,
            ..self.clone()
        }
    }
}

#[derive(Clone)]
pub struct Transformer {
    cache: Arc<dyn CachedDownloader>,
    uploader: Arc<dyn Uploader>,
    download_limiter: RateLimiter,
    upload_limiter: RateLimiter,
    health_check_work_pool: RateLimiter,
    healthy_monitoring_interval: Duration,
    unhealthy_monitoring_interval: Duration,
    export_network_env_vars: bool,
    post_setup_hook: Vec<String>,
    post_setup_user: String,
    declarative_healthcheck: bool,
    declarative_healthcheck_path: String,
}

/// Port, timeout and optional URI shared by a check's readiness and liveness runs.
struct HealthCheckTarget {
    port: u32,
    timeout_ms: u64,
    uri: Option<String>,
}

impl HealthCheckTarget {
    fn of(check: &Check) -> Option<Self> {
        let with_default = |ms: u64| {
            if ms == 0 {
                DEFAULT_HEALTH_CHECK_REQUEST_TIMEOUT_MS
            } else {
                ms
            }
        };
        if let Some(http) = &check.http_check {
            let uri = if http.path.is_empty() { "/" } else { http.path.as_str() };
            return Some(Self {
                port: http.port,
                timeout_ms: with_default(http.request_timeout_ms),
                uri: Some(uri.to_string()),
            });
        }
        check.tcp_check.as_ref().map(|tcp| Self {
            port: tcp.port,
            timeout_ms: with_default(tcp.connect_timeout_ms),
            uri: None,
        })
    }
}

impl Transformer {
    /// `download_limiter` is shared with the dependency manager so both draw
    /// from the same host-wide budget.
    pub fn new(
        settings: &ExecutorSettings,
        cache: Arc<dyn CachedDownloader>,
        uploader: Arc<dyn Uploader>,
        download_limiter: RateLimiter,
    ) -> Self {
        Self {
            cache,
            uploader,
            download_limiter,
            upload_limiter: settings.upload_limiter(),
            health_check_work_pool: settings.health_check_work_pool(),
            healthy_monitoring_interval: settings.healthy_monitoring_interval(),
            unhealthy_monitoring_interval: settings.unhealthy_monitoring_interval(),
            export_network_env_vars: settings.export_network_env_vars,
            post_setup_hook: settings.post_setup_hook.clone(),
            post_setup_user: settings.post_setup_user.clone(),
            declarative_healthcheck: settings.declarative_healthcheck,
            declarative_healthcheck_path: settings.declarative_healthcheck_path.clone(),
        }
    }

    /// Compile one action tree. Performs no I/O.
    pub fn step_for(&self, ctx: &StepContext, action: &Action) -> Box<dyn Step> {
        tracing::trace!(kind = action.kind(), health_check = ctx.health_check, "transformer-step-for");
        let ctx = &ctx.with_streamer(ctx.streamer.with_source(action.log_source()));

        match action {
            Action::Run(run) => Box::new(RunStep::new(
                Arc::clone(&ctx.container),
                run.clone(),
                ctx.streamer.clone(),
                ctx.network.clone(),
                self.export_network_env_vars,
                ctx.health_check,
            )),

            Action::Download(download) => Box::new(DownloadStep::new(
                Arc::clone(&ctx.container),
                download.clone(),
                Arc::clone(&self.cache),
                self.download_limiter.clone(),
                ctx.streamer.clone(),
            )),

            Action::Upload(upload) => Box::new(UploadStep::new(
                Arc::clone(&ctx.container),
                upload.clone(),
                Arc::clone(&self.uploader),
                self.upload_limiter.clone(),
                ctx.streamer.clone(),
            )),

            Action::EmitProgress(emit) => Box::new(EmitProgressStep::new(
                self.step_for(ctx, &emit.action),
                emit.start_message.clone(),
                emit.success_message.clone(),
                emit.failure_message_prefix.clone(),
                ctx.streamer.clone(),
            )),

            Action::Timeout(timeout) => Box::new(TimeoutStep::new(
                self.step_for(ctx, &timeout.action),
                timeout.timeout(),
            )),

            Action::Try(try_action) => Box::new(TryStep::new(self.step_for(ctx, &try_action.action))),

            Action::Parallel(parallel) => {
                Box::new(ParallelStep::new(self.concurrent_children(ctx, &parallel.actions)))
            }

            Action::Codependent(codependent) => Box::new(CodependentStep::new(
                self.concurrent_children(ctx, &codependent.actions),
                true,
            )),

            Action::Serial(serial) => Box::new(SerialStep::new(
                serial
                    .actions
                    .iter()
                    .map(|child| self.step_for(ctx, child))
                    .collect(),
            )),

            Action::Monitor(monitor) => {
                // Nobody waits on a nested monitor's started signal.
                let (started, _) = StartedSignal::channel();
                self.monitor_step(ctx, (*monitor.action).clone(), started, monitor.start_timeout())
            }
        }
    }

    /// Children of Parallel and Codependent. Inside a health check each child
    /// writes to its own buffer, which becomes its error message on failure.
    fn concurrent_children(&self, ctx: &StepContext, actions: &[Action]) -> Vec<Box<dyn Step>> {
        actions
            .iter()
            .map(|child| {
                if ctx.health_check {
                    let buffer = Arc::new(CollectingLogSink::new());
                    let child_ctx = ctx.with_streamer(LogStreamer::new(
                        buffer.clone(),
                        ctx.streamer.source_name(),
                    ));
                    Box::new(OutputWrapperStep::new(self.step_for(&child_ctx, child), buffer))
                        as Box<dyn Step>
                } else {
                    self.step_for(ctx, child)
                }
            })
            .collect()
    }

    fn monitor_step(
        &self,
        ctx: &StepContext,
        check: Action,
        started: Arc<StartedSignal>,
        start_timeout: Duration,
    ) -> Box<dyn Step> {
        let transformer = self.clone();
        let check_ctx = ctx.for_health_check();
        let factory: CheckFactory = Arc::new(move || transformer.step_for(&check_ctx, &check));

        Box::new(MonitorStep::new(
            factory,
            started,
            ctx.streamer.clone(),
            start_timeout,
            self.healthy_monitoring_interval,
            self.unhealthy_monitoring_interval,
            self.health_check_work_pool.clone(),
        ))
    }

    /// Compile a check definition into health-check processes: readiness
    /// checks run in parallel, liveness checks codependently. Returns `None`
    /// when no check is valid.
    fn check_definition_step(
        &self,
        ctx: &StepContext,
        definition: &CheckDefinition,
        started: Arc<StartedSignal>,
        start_timeout: Duration,
    ) -> Option<Box<dyn Step>> {
        let source = if definition.log_source.is_empty() {
            HEALTH_LOG_SOURCE
        } else {
            definition.log_source.as_str()
        };

        let mut readiness = Vec::new();
        let mut liveness = Vec::new();
        for check in &definition.checks {
            if let Err(err) = check.validate() {
                tracing::error!(error = %err, check = ?check, "invalid-check");
                continue;
            }
            let Some(target) = HealthCheckTarget::of(check) else {
                continue;
            };
            readiness.push(self.health_check_process(
                ctx,
                &target,
                source,
                vec![
                    format!(
                        "-readiness-interval={}",
                        StringUtil::format_duration(self.unhealthy_monitoring_interval)
                    ),
                    format!("-readiness-timeout={}", StringUtil::format_duration(start_timeout)),
                ],
            ));
            liveness.push(self.health_check_process(
                ctx,
                &target,
                source,
                vec![format!(
                    "-liveness-interval={}",
                    StringUtil::format_duration(self.healthy_monitoring_interval)
                )],
            ));
        }

        if readiness.is_empty() {
            tracing::info!(checks = definition.checks.len(), "check-definition-has-no-valid-checks");
            return None;
        }

        Some(Box::new(LongRunningMonitorStep::new(
            Box::new(ParallelStep::new(readiness)),
            Box::new(CodependentStep::new(liveness, false)),
            started,
            ctx.streamer.clone(),
            ctx.streamer.with_source(source),
            start_timeout,
        )))
    }

    /// One run of the health-check binary. Its output is buffered and becomes
    /// the error message when it fails.
    fn health_check_process(
        &self,
        ctx: &StepContext,
        target: &HealthCheckTarget,
        source: &str,
        phase_args: Vec<String>,
    ) -> Box<dyn Step> {
        let mut run = RunAction::new(self.declarative_healthcheck_path.clone(), HEALTH_CHECK_USER);
        run.args = vec![
            format!("-port={}", target.port),
            format!("-timeout={}ms", target.timeout_ms),
        ];
        if let Some(uri) = &target.uri {
            run.args.push(format!("-uri={uri}"));
        }
        run.args.extend(phase_args);
        run.resource_limits.nofile = Some(HEALTH_CHECK_NOFILE);
        run.log_source = source.to_string();

        let buffer = Arc::new(CollectingLogSink::new());
        let step = RunStep::new(
            Arc::clone(&ctx.container),
            run,
            LogStreamer::new(buffer.clone(), source),
            ctx.network.clone(),
            self.export_network_env_vars,
            true,
        );
        Box::new(OutputWrapperStep::new(Box::new(step), buffer))
    }

    fn post_setup_step(&self, ctx: &StepContext) -> Option<Box<dyn Step>> {
        let (path, args) = self.post_setup_hook.split_first()?;
        let mut run = RunAction::new(path.clone(), self.post_setup_user.clone());
        run.args = args.to_vec();
        run.suppress_log_output = true;
        Some(Box::new(RunStep::new(
            Arc::clone(&ctx.container),
            run,
            LogStreamer::noop(),
            ctx.network.clone(),
            self.export_network_env_vars,
            false,
        )))
    }

    /// Assemble setup, the post-setup hook and the long-lived action (paired
    /// with its monitor, if any) into the container's runner. With declarative
    /// health checks enabled, a check definition takes the monitor's place.
    pub fn steps_runner(
        &self,
        spec: &ContainerSpec,
        container: Arc<dyn Container>,
        streamer: &LogStreamer,
    ) -> Result<StepRunner, TransformError> {
        let Some(action) = spec.action.as_ref() else {
            tracing::error!(guid = %spec.guid, "steps-runner-empty-action");
            return Err(TransformError::MissingAction {
                guid: spec.guid.clone(),
            });
        };

        let network = NetworkInfo {
            external_ip: spec.external_ip.clone(),
            internal_ip: spec.internal_ip.clone(),
            ports: spec.ports.clone(),
        };
        let ctx = StepContext::new(container, streamer.clone(), network);

        let setup = spec.setup.as_ref().map(|setup| self.step_for(&ctx, setup));
        let action = self.step_for(&ctx, action);

        let (started, started_rx) = StartedSignal::channel();
        let monitor = match (&spec.check_definition, &spec.monitor) {
            (Some(definition), _) if self.declarative_healthcheck => self.check_definition_step(
                &ctx,
                definition,
                Arc::clone(&started),
                spec.start_timeout(),
            ),
            (_, Some(check)) => Some(self.monitor_step(
                &ctx,
                check.clone(),
                Arc::clone(&started),
                spec.start_timeout(),
            )),
            _ => None,
        };
        let long_lived = match monitor {
            Some(monitor) => {
                Box::new(CodependentStep::new(vec![action, monitor], true)) as Box<dyn Step>
            }
            None => {
                // Unmonitored containers count as running right away.
                started.fire();
                action
            }
        };

        let root = match setup {
            None => long_lived,
            Some(setup) => {
                let mut steps = vec![setup];
                steps.extend(self.post_setup_step(&ctx));
                steps.push(long_lived);
                Box::new(SerialStep::new(steps)) as Box<dyn Step>
            }
        };

        Ok(StepRunner::new(root, started_rx))
    }
}
