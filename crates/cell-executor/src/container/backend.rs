// Isolation backend contract: the opaque container runtime the executor drives.

use async_trait::async_trait;
use cell_sdk::LogStreamer;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;

use crate::action::ResourceLimits;
use crate::container::spec::BindMount;

/// A byte stream moved into or out of a container (tar data).
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Signals the executor sends to container processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Terminate => write!(f, "terminate"),
            Signal::Kill => write!(f, "kill"),
        }
    }
}

/// Event reported by the backend when a container ran out of memory.
pub const OUT_OF_MEMORY_EVENT: &str = "Out of memory";

/// Parameters for creating a backend container.
#[derive(Debug, Clone, Default)]
pub struct BackendContainerSpec {
    pub handle: String,
    pub bind_mounts: Vec<BindMount>,
    /// `NAME=value` pairs.
    pub env: Vec<String>,
    /// Opaque tags used to recover ownership after a restart.
    pub properties: HashMap<String, String>,
}

/// A process to start inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub dir: String,
    /// `NAME=value` pairs.
    pub env: Vec<String>,
    pub user: String,
    pub limits: ResourceLimits,
}

/// Where a process's output goes.
#[derive(Debug, Clone)]
pub enum ProcessIo {
    Stream(LogStreamer),
    Discard,
}

/// Source or destination path for streaming data into or out of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSpec {
    pub path: String,
    pub user: String,
}

/// Snapshot of a container's runtime state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub events: Vec<String>,
}

impl ContainerInfo {
    pub fn ran_out_of_memory(&self) -> bool {
        self.events.iter().any(|e| e == OUT_OF_MEMORY_EVENT)
    }
}

/// A running process.
#[async_trait]
pub trait Process: Send + Sync {
    fn id(&self) -> &str;

    /// Wait for the process to exit and return its exit status.
    async fn wait(&self) -> anyhow::Result<i32>;

    async fn signal(&self, signal: Signal) -> anyhow::Result<()>;
}

/// A created container.
#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> anyhow::Result<Box<dyn Process>>;

    /// Extract a tar stream at `spec.path`.
    async fn stream_in(&self, spec: StreamSpec, stream: ByteStream) -> anyhow::Result<()>;

    /// Produce a tar stream of `spec.path`.
    async fn stream_out(&self, spec: StreamSpec) -> anyhow::Result<ByteStream>;

    async fn info(&self) -> anyhow::Result<ContainerInfo>;
}

/// The container runtime.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn create(&self, spec: BackendContainerSpec) -> anyhow::Result<Arc<dyn Container>>;

    /// Handles of every container carrying all of `properties`.
    async fn list(&self, properties: &HashMap<String, String>) -> anyhow::Result<Vec<String>>;

    async fn destroy(&self, handle: &str) -> anyhow::Result<()>;
}
