// Action: declarative, serde-deserializable description of container setup,
// execution and monitoring. Compiled into steps by the transformer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One node of an action tree.
///
/// Serialized externally tagged, e.g. `{"run": {"path": "/bin/sh"}}`.
/// An unknown tag is rejected at deserialization, so every `Action` value
/// is compilable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Run(RunAction),
    Download(DownloadAction),
    Upload(UploadAction),
    EmitProgress(EmitProgressAction),
    Timeout(TimeoutAction),
    Try(TryAction),
    Parallel(ParallelAction),
    Codependent(CodependentAction),
    Serial(SerialAction),
    Monitor(MonitorAction),
}

impl Action {
    /// Short variant name used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Run(_) => "run",
            Action::Download(_) => "download",
            Action::Upload(_) => "upload",
            Action::EmitProgress(_) => "emit_progress",
            Action::Timeout(_) => "timeout",
            Action::Try(_) => "try",
            Action::Parallel(_) => "parallel",
            Action::Codependent(_) => "codependent",
            Action::Serial(_) => "serial",
            Action::Monitor(_) => "monitor",
        }
    }

    /// Log source tag attached to this node. Empty means "inherit".
    pub fn log_source(&self) -> &str {
        match self {
            Action::Run(a) => &a.log_source,
            Action::Download(a) => &a.log_source,
            Action::Upload(a) => &a.log_source,
            Action::EmitProgress(a) => &a.log_source,
            Action::Timeout(a) => &a.log_source,
            Action::Try(a) => &a.log_source,
            Action::Parallel(a) => &a.log_source,
            Action::Codependent(a) => &a.log_source,
            Action::Serial(a) => &a.log_source,
            Action::Monitor(a) => &a.log_source,
        }
    }

    // -----------------------------------------------------------------------
    // Constructors for composite nodes
    // -----------------------------------------------------------------------

    pub fn serial(actions: Vec<Action>) -> Self {
        Action::Serial(SerialAction {
            actions,
            log_source: String::new(),
        })
    }

    pub fn parallel(actions: Vec<Action>) -> Self {
        Action::Parallel(ParallelAction {
            actions,
            log_source: String::new(),
        })
    }

    pub fn codependent(actions: Vec<Action>) -> Self {
        Action::Codependent(CodependentAction {
            actions,
            log_source: String::new(),
        })
    }

    pub fn try_action(action: Action) -> Self {
        Action::Try(TryAction {
            action: Box::new(action),
            log_source: String::new(),
        })
    }

    pub fn timeout(action: Action, timeout: Duration) -> Self {
        Action::Timeout(TimeoutAction {
            action: Box::new(action),
            timeout_ms: timeout.as_millis() as u64,
            log_source: String::new(),
        })
    }

    pub fn emit_progress(
        action: Action,
        start_message: &str,
        success_message: &str,
        failure_message_prefix: &str,
    ) -> Self {
        Action::EmitProgress(EmitProgressAction {
            action: Box::new(action),
            start_message: start_message.to_string(),
            success_message: success_message.to_string(),
            failure_message_prefix: failure_message_prefix.to_string(),
            log_source: String::new(),
        })
    }

    pub fn monitor(check: Action, start_timeout: Duration) -> Self {
        Action::Monitor(MonitorAction {
            action: Box::new(check),
            start_timeout_ms: start_timeout.as_millis() as u64,
            log_source: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Leaf actions
// ---------------------------------------------------------------------------

/// An environment variable passed to a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

impl EnvironmentVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Process resource limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nofile: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nproc: Option<u64>,
}

/// Run a process inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAction {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Discard the process output instead of streaming it.
    #[serde(default)]
    pub suppress_log_output: bool,
    #[serde(default)]
    pub log_source: String,
}

impl RunAction {
    pub fn new(path: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            user: user.into(),
            ..Self::default()
        }
    }
}

impl From<RunAction> for Action {
    fn from(action: RunAction) -> Self {
        Action::Run(action)
    }
}

/// Download an archive through the cache and extract it into the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadAction {
    /// Display name used in progress lines. Empty downloads are silent.
    #[serde(default)]
    pub artifact: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub cache_key: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub checksum_algorithm: String,
    #[serde(default)]
    pub checksum_value: String,
    #[serde(default)]
    pub log_source: String,
}

impl From<DownloadAction> for Action {
    fn from(action: DownloadAction) -> Self {
        Action::Download(action)
    }
}

/// Stream a file out of the container and upload it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAction {
    /// Display name used in progress lines. Empty uploads are silent.
    #[serde(default)]
    pub artifact: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub log_source: String,
}

impl From<UploadAction> for Action {
    fn from(action: UploadAction) -> Self {
        Action::Upload(action)
    }
}

// ---------------------------------------------------------------------------
// Wrapping actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitProgressAction {
    pub action: Box<Action>,
    #[serde(default)]
    pub start_message: String,
    #[serde(default)]
    pub success_message: String,
    #[serde(default)]
    pub failure_message_prefix: String,
    #[serde(default)]
    pub log_source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutAction {
    pub action: Box<Action>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub log_source: String,
}

impl TimeoutAction {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryAction {
    pub action: Box<Action>,
    #[serde(default)]
    pub log_source: String,
}

/// Repeated health check. The check action is compiled afresh for every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorAction {
    pub action: Box<Action>,
    /// Time allowed for the first successful check. Zero disables the limit.
    #[serde(default)]
    pub start_timeout_ms: u64,
    #[serde(default)]
    pub log_source: String,
}

impl MonitorAction {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Composite actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelAction {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub log_source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodependentAction {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub log_source: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialAction {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub log_source: String,
}
