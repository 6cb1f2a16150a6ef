// ExecutorSettings: typed executor configuration with defaults, JSON loading and validation.

use crate::constants::*;

use cell_sdk::RateLimiter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Errors raised while loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings")]
    Parse(#[from] serde_json::Error),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// LoggingSettings
// ---------------------------------------------------------------------------

/// Diagnostic logging options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, e.g. `info` or `cell_executor=debug`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorSettings
// ---------------------------------------------------------------------------

/// Settings for one executor process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Value of the owner property stamped on every container this executor creates.
    pub owner_name: String,

    /// Interval between reaper passes.
    pub reap_interval_ms: u64,

    /// Time a container may stay reserved without being created. The registry
    /// pruner completes it afterwards.
    pub reserved_expiration_ms: u64,

    /// Process-wide ceiling on concurrent dependency and artifact downloads.
    pub max_concurrent_downloads: usize,

    /// Process-wide ceiling on concurrent artifact uploads.
    pub max_concurrent_uploads: usize,

    /// Host-wide ceiling on concurrently running health checks.
    pub health_check_work_pool_size: usize,

    /// Health-check interval once a container has become healthy.
    pub healthy_monitoring_interval_ms: u64,

    /// Health-check interval until a container becomes healthy.
    pub unhealthy_monitoring_interval_ms: u64,

    /// Export the container's addresses and ports as environment variables to run steps.
    pub export_network_env_vars: bool,

    /// Command run inside the container after setup and before the main action.
    /// The first element is the executable path. Empty disables the hook.
    pub post_setup_hook: Vec<String>,

    /// User the post-setup hook runs as.
    pub post_setup_user: String,

    /// Compile a container's check definition into health-check processes
    /// instead of running its monitor action.
    pub declarative_healthcheck: bool,

    /// In-container path of the health-check executable.
    pub declarative_healthcheck_path: String,

    pub logging: LoggingSettings,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            owner_name: DEFAULT_OWNER_NAME.to_string(),
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
            reserved_expiration_ms: DEFAULT_RESERVED_EXPIRATION_MS,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_concurrent_uploads: DEFAULT_MAX_CONCURRENT_UPLOADS,
            health_check_work_pool_size: DEFAULT_HEALTH_CHECK_WORK_POOL_SIZE,
            healthy_monitoring_interval_ms: DEFAULT_HEALTHY_MONITORING_INTERVAL_MS,
            unhealthy_monitoring_interval_ms: DEFAULT_UNHEALTHY_MONITORING_INTERVAL_MS,
            export_network_env_vars: false,
            post_setup_hook: Vec::new(),
            post_setup_user: "root".to_string(),
            declarative_healthcheck: false,
            declarative_healthcheck_path: DEFAULT_DECLARATIVE_HEALTHCHECK_PATH.to_string(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ExecutorSettings {
    /// Parse settings from a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Reject values the executor cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.owner_name.trim().is_empty() {
            return Err(invalid("owner_name", "must not be empty"));
        }
        let positive: [(&'static str, u64); 7] = [
            ("reap_interval_ms", self.reap_interval_ms),
            ("reserved_expiration_ms", self.reserved_expiration_ms),
            ("max_concurrent_downloads", self.max_concurrent_downloads as u64),
            ("max_concurrent_uploads", self.max_concurrent_uploads as u64),
            ("health_check_work_pool_size", self.health_check_work_pool_size as u64),
            ("healthy_monitoring_interval_ms", self.healthy_monitoring_interval_ms),
            ("unhealthy_monitoring_interval_ms", self.unhealthy_monitoring_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self
            .post_setup_hook
            .first()
            .is_some_and(|path| path.trim().is_empty())
        {
            return Err(invalid("post_setup_hook", "executable path must not be empty"));
        }
        if self.declarative_healthcheck && self.declarative_healthcheck_path.trim().is_empty() {
            return Err(invalid(
                "declarative_healthcheck_path",
                "must not be empty when declarative health checks are enabled",
            ));
        }
        Ok(())
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn reserved_expiration(&self) -> Duration {
        Duration::from_millis(self.reserved_expiration_ms)
    }

    pub fn healthy_monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.healthy_monitoring_interval_ms)
    }

    pub fn unhealthy_monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.unhealthy_monitoring_interval_ms)
    }

    /// Build the process-wide download limiter.
    pub fn download_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.max_concurrent_downloads)
    }

    /// Build the process-wide upload limiter.
    pub fn upload_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.max_concurrent_uploads)
    }

    /// Build the host-wide health-check work pool.
    pub fn health_check_work_pool(&self) -> RateLimiter {
        RateLimiter::new(self.health_check_work_pool_size)
    }
}

fn invalid(field: &'static str, reason: &str) -> SettingsError {
    SettingsError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
