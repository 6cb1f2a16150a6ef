use async_trait::async_trait;
use cell_common::constants::{network_env, EXIT_TIMEOUT_MS, TERMINATE_TIMEOUT_MS};
use cell_sdk::LogStreamer;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Step, StepError};
use crate::action::RunAction;
use crate::container::{Container, PortMapping, Process, ProcessIo, ProcessSpec, Signal};

const TERMINATE_TIMEOUT: Duration = Duration::from_millis(TERMINATE_TIMEOUT_MS);
const EXIT_TIMEOUT: Duration = Duration::from_millis(EXIT_TIMEOUT_MS);

/// Addresses and ports of the container, optionally exported to processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub external_ip: String,
    pub internal_ip: String,
    pub ports: Vec<PortMapping>,
}

#[derive(Serialize)]
struct PortEntry {
    external: u16,
    internal: u16,
}

impl NetworkInfo {
    /// `NAME=value` pairs describing the container's network.
    pub fn env_vars(&self) -> Vec<String> {
        let mut vars = vec![
            format!("{}={}", network_env::INSTANCE_IP, self.external_ip),
            format!("{}={}", network_env::INSTANCE_INTERNAL_IP, self.internal_ip),
        ];

        let (port, addr) = match self.ports.first() {
            Some(first) => (
                first.host_port.to_string(),
                format!("{}:{}", self.external_ip, first.host_port),
            ),
            None => (String::new(), String::new()),
        };
        vars.push(format!("{}={}", network_env::INSTANCE_PORT, port));
        vars.push(format!("{}={}", network_env::INSTANCE_ADDR, addr));

        let entries: Vec<PortEntry> = self
            .ports
            .iter()
            .map(|p| PortEntry {
                external: p.host_port,
                internal: p.container_port,
            })
            .collect();
        let ports = serde_json::to_string(&entries).unwrap_or_else(|_| "[]".to_string());
        vars.push(format!("{}={}", network_env::INSTANCE_PORTS, ports));
        vars
    }
}

/// Runs a process in the container.
///
/// On cancel the process is sent a terminate signal, then a kill signal after
/// a grace period; if it still has not exited shortly after that the step
/// gives up with [`StepError::ExitTimeout`].
pub struct RunStep {
    container: Arc<dyn Container>,
    model: RunAction,
    streamer: LogStreamer,
    network: NetworkInfo,
    export_network_env_vars: bool,
    suppress_exit_status_code: bool,
    cancel: CancellationToken,
}

impl RunStep {
    pub fn new(
        container: Arc<dyn Container>,
        model: RunAction,
        streamer: LogStreamer,
        network: NetworkInfo,
        export_network_env_vars: bool,
        suppress_exit_status_code: bool,
    ) -> Self {
        Self {
            container,
            model,
            streamer,
            network,
            export_network_env_vars,
            suppress_exit_status_code,
            cancel: CancellationToken::new(),
        }
    }

    fn process_spec(&self) -> ProcessSpec {
        let mut env: Vec<String> = self
            .model
            .env
            .iter()
            .map(|e| format!("{}={}", e.name, e.value))
            .collect();
        if self.export_network_env_vars {
            env.extend(self.network.env_vars());
        }
        ProcessSpec {
            path: self.model.path.clone(),
            args: self.model.args.clone(),
            dir: self.model.dir.clone(),
            env,
            user: self.model.user.clone(),
            limits: self.model.resource_limits.clone(),
        }
    }

    async fn send_signal(&self, process: &dyn Process, signal: Signal) {
        if let Err(e) = process.signal(signal).await {
            tracing::error!(process = process.id(), %signal, "Failed to signal process: {:#}", e);
        }
    }

    /// Build the exit line and the emittable failure message for `status`.
    async fn exit_messages(&self, status: i32) -> (String, String) {
        let (mut exit_line, mut emittable) = if self.suppress_exit_status_code {
            (String::new(), String::new())
        } else {
            (
                format!("Exit status {status}"),
                format!("{}: Exited with status {status}", self.streamer.source_name()),
            )
        };

        if status != 0 {
            match self.container.info().await {
                Ok(info) if info.ran_out_of_memory() => {
                    exit_line.push_str(" (out of memory)");
                    emittable.push_str(" (out of memory)");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Failed to get container info: {:#}", e),
            }
        }
        (exit_line, emittable)
    }
}

#[async_trait]
impl Step for RunStep {
    async fn perform(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let io = if self.model.suppress_log_output {
            ProcessIo::Discard
        } else {
            ProcessIo::Stream(self.streamer.clone())
        };

        let process = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
            created = self.container.run(self.process_spec(), io) => match created {
                Ok(process) => process,
                Err(e) => {
                    tracing::error!(path = %self.model.path, "Failed to create process: {:#}", e);
                    return Err(StepError::Other(e));
                }
            },
        };
        tracing::debug!(process = process.id(), path = %self.model.path, "run-step-process-created");

        let wait = process.wait();
        tokio::pin!(wait);

        let mut cancelled = false;
        let exited = tokio::select! {
            exited = &mut wait => exited,
            _ = self.cancel.cancelled() => {
                cancelled = true;
                self.send_signal(process.as_ref(), Signal::Terminate).await;
                match tokio::time::timeout(TERMINATE_TIMEOUT, &mut wait).await {
                    Ok(exited) => exited,
                    Err(_) => {
                        self.send_signal(process.as_ref(), Signal::Kill).await;
                        match tokio::time::timeout(EXIT_TIMEOUT, &mut wait).await {
                            Ok(exited) => exited,
                            Err(_) => {
                                tracing::error!(process = process.id(), timeout_ms = EXIT_TIMEOUT_MS, "process-did-not-exit");
                                return Err(StepError::ExitTimeout);
                            }
                        }
                    }
                }
            }
        };

        let status = match exited {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(process = process.id(), "Failed while waiting for process: {:#}", e);
                return Err(StepError::Other(e));
            }
        };
        tracing::info!(process = process.id(), exit_status = status, cancelled, "process-exit");

        let (exit_line, emittable) = self.exit_messages(status).await;
        if !self.model.suppress_log_output && !exit_line.is_empty() {
            self.streamer.stdout(&exit_line);
        }

        if cancelled {
            return Err(StepError::Cancelled);
        }
        if status != 0 {
            tracing::error!(exit_status = status, "run-step-failed-with-nonzero-status-code");
            return Err(StepError::emittable(emittable));
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
