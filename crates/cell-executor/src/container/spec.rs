// ContainerSpec: per-container workload description consumed by the store and transformer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::action::{Action, EnvironmentVariable};

/// Host/container port pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// One external artifact mounted into the container from the dependency cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedDependency {
    /// Display name for progress lines. Unnamed dependencies are silent.
    #[serde(default)]
    pub name: String,
    pub from: String,
    pub to: String,
    pub cache_key: String,
    #[serde(default)]
    pub checksum_algorithm: String,
    #[serde(default)]
    pub checksum_value: String,
    #[serde(default)]
    pub log_source: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountOrigin {
    #[default]
    Host,
    Container,
}

/// A host directory mapped into the container's filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    #[serde(default)]
    pub mode: BindMountMode,
    #[serde(default)]
    pub origin: BindMountOrigin,
}

impl BindMount {
    /// A read-only mount of a host directory.
    pub fn host_read_only(src_path: impl Into<String>, dst_path: impl Into<String>) -> Self {
        Self {
            src_path: src_path.into(),
            dst_path: dst_path.into(),
            mode: BindMountMode::ReadOnly,
            origin: BindMountOrigin::Host,
        }
    }
}

/// Errors raised by `Check::validate`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckError {
    #[error("check must have exactly one of tcp_check or http_check")]
    InvalidType,

    #[error("check port {0} is out of range")]
    InvalidPort(u32),
}

/// A health check against a TCP port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpCheck {
    pub port: u32,
    /// Zero means the default request timeout.
    #[serde(default)]
    pub connect_timeout_ms: u64,
}

/// A health check issuing an HTTP GET.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheck {
    pub port: u32,
    /// Zero means the default request timeout.
    #[serde(default)]
    pub request_timeout_ms: u64,
    /// Empty means `/`.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_check: Option<TcpCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check: Option<HttpCheck>,
}

impl Check {
    pub fn tcp(port: u32) -> Self {
        Self {
            tcp_check: Some(TcpCheck {
                port,
                ..TcpCheck::default()
            }),
            http_check: None,
        }
    }

    pub fn http(port: u32, path: impl Into<String>) -> Self {
        Self {
            tcp_check: None,
            http_check: Some(HttpCheck {
                port,
                path: path.into(),
                ..HttpCheck::default()
            }),
        }
    }

    pub fn validate(&self) -> Result<(), CheckError> {
        let port = match (&self.tcp_check, &self.http_check) {
            (Some(tcp), None) => tcp.port,
            (None, Some(http)) => http.port,
            _ => return Err(CheckError::InvalidType),
        };
        if port == 0 || port > u32::from(u16::MAX) {
            return Err(CheckError::InvalidPort(port));
        }
        Ok(())
    }
}

/// Health checks run by the executor's health-check binary instead of a
/// monitor action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDefinition {
    #[serde(default)]
    pub checks: Vec<Check>,
    /// Source tag of the checks' output. Empty means `HEALTH`.
    #[serde(default)]
    pub log_source: String,
}

/// Everything needed to prepare, run and supervise one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub guid: String,
    #[serde(default)]
    pub setup: Option<Action>,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub monitor: Option<Action>,
    /// Used instead of `monitor` when declarative health checks are enabled.
    #[serde(default)]
    pub check_definition: Option<CheckDefinition>,
    /// Time allowed for the monitor's first successful check. Zero disables the limit.
    #[serde(default)]
    pub start_timeout_ms: u64,
    #[serde(default)]
    pub external_ip: String,
    #[serde(default)]
    pub internal_ip: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub cached_dependencies: Vec<CachedDependency>,
    #[serde(default)]
    pub log_source: String,
}

impl ContainerSpec {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            ..Self::default()
        }
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}
