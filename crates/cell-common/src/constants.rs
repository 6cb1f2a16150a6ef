// Constants shared by the cell executor crates.

use std::fmt;

// ---------------------------------------------------------------------------
// Container properties
// ---------------------------------------------------------------------------

/// Backend container property naming the executor that created the container.
/// The reaper lists containers by this property.
pub const OWNER_PROPERTY: &str = "executor:owner";

/// Default value of the owner property.
pub const DEFAULT_OWNER_NAME: &str = "executor";

// ---------------------------------------------------------------------------
// Timing defaults
// ---------------------------------------------------------------------------

/// Default interval between reaper passes, in milliseconds.
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 60_000;

/// Default time a container may stay reserved before the pruner expires it,
/// in milliseconds.
pub const DEFAULT_RESERVED_EXPIRATION_MS: u64 = 60_000;

/// Default health-check interval once a container is healthy, in milliseconds.
pub const DEFAULT_HEALTHY_MONITORING_INTERVAL_MS: u64 = 30_000;

/// Default health-check interval until a container becomes healthy, in milliseconds.
pub const DEFAULT_UNHEALTHY_MONITORING_INTERVAL_MS: u64 = 500;

/// Grace period between terminating a process and killing it, in milliseconds.
pub const TERMINATE_TIMEOUT_MS: u64 = 10_000;

/// Time allowed for a killed process to report its exit, in milliseconds.
pub const EXIT_TIMEOUT_MS: u64 = 1_000;

// ---------------------------------------------------------------------------
// Capacity defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 5;
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 5;
pub const DEFAULT_HEALTH_CHECK_WORK_POOL_SIZE: usize = 64;

/// Longest error text copied into a container log line before truncation.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Capacity of the container lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Declarative health checks
// ---------------------------------------------------------------------------

/// In-container path of the health-check executable.
pub const DEFAULT_DECLARATIVE_HEALTHCHECK_PATH: &str = "/etc/cf-assets/healthcheck/healthcheck";

/// User the health-check executable runs as.
pub const HEALTH_CHECK_USER: &str = "root";

/// Open-file limit applied to health-check processes.
pub const HEALTH_CHECK_NOFILE: u64 = 1024;

/// Request or connect timeout used when a check does not set one, in milliseconds.
pub const DEFAULT_HEALTH_CHECK_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Log source of health-check output when the definition does not name one.
pub const HEALTH_LOG_SOURCE: &str = "HEALTH";

// ---------------------------------------------------------------------------
// Network environment variables
// ---------------------------------------------------------------------------

/// Names of the environment variables describing the container's network.
pub mod network_env {
    pub const INSTANCE_IP: &str = "INSTANCE_IP";
    pub const INSTANCE_INTERNAL_IP: &str = "INSTANCE_INTERNAL_IP";
    pub const INSTANCE_PORT: &str = "INSTANCE_PORT";
    pub const INSTANCE_ADDR: &str = "INSTANCE_ADDR";
    pub const INSTANCE_PORTS: &str = "INSTANCE_PORTS";
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Reasons recorded on containers that complete as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    DependencyDownloadFailed,
    ContainerCreationFailed,
    StoppedBeforeRunning,
    MissingContainer,
    BindMountCleanupFailed,
    ReservationExpired,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::DependencyDownloadFailed => "failed to download cached artifacts",
            FailureReason::ContainerCreationFailed => "failed to create container",
            FailureReason::StoppedBeforeRunning => "stopped before running",
            FailureReason::MissingContainer => "missing container",
            FailureReason::BindMountCleanupFailed => "failed to cleanup bindmount artifacts",
            FailureReason::ReservationExpired => "expired container",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
