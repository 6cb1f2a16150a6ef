// LogStreamer: per-container, per-source line sink for progress messages and process output.

use std::fmt;
use std::sync::Arc;

/// Which of the two container-facing streams a line is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Destination for container log lines.
///
/// Implementations must be cheap to call from many tasks at once; the executor
/// writes to the same sink from every step of a container concurrently.
pub trait LogSink: Send + Sync {
    /// Write one line tagged with its log source and stream.
    fn write(&self, source: &str, stream: OutputStream, message: &str);
}

/// Forwards every line to the `tracing` crate under the `container_log` target.
#[derive(Debug, Clone, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, source: &str, stream: OutputStream, message: &str) {
        match stream {
            OutputStream::Stdout => {
                tracing::info!(target: "container_log", source, "{}", message)
            }
            OutputStream::Stderr => {
                tracing::warn!(target: "container_log", source, "{}", message)
            }
        }
    }
}

/// Discards all lines.
#[derive(Debug, Clone, Default)]
pub struct NullLogSink;

impl LogSink for NullLogSink {
    fn write(&self, _source: &str, _stream: OutputStream, _message: &str) {}
}

/// A collected log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: String,
    pub stream: OutputStream,
    pub message: String,
}

/// Buffers every line in memory.
///
/// Used by tests and by output wrappers that turn a failing step's output
/// into its error message.
#[derive(Debug, Default)]
pub struct CollectingLogSink {
    lines: parking_lot::Mutex<Vec<LogLine>>,
}

impl CollectingLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return all collected lines in write order.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().clone()
    }

    /// Messages written to stdout, in order.
    pub fn stdout_lines(&self) -> Vec<String> {
        self.filter(Some(OutputStream::Stdout))
    }

    /// Messages written to stderr, in order.
    pub fn stderr_lines(&self) -> Vec<String> {
        self.filter(Some(OutputStream::Stderr))
    }

    /// Every message regardless of stream, joined with newlines.
    pub fn text(&self) -> String {
        self.filter(None).join("\n")
    }

    /// Clear collected lines.
    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    fn filter(&self, stream: Option<OutputStream>) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|l| stream.map_or(true, |s| l.stream == s))
            .map(|l| l.message.clone())
            .collect()
    }
}

impl LogSink for CollectingLogSink {
    fn write(&self, source: &str, stream: OutputStream, message: &str) {
        self.lines.lock().push(LogLine {
            source: source.to_string(),
            stream,
            message: message.to_string(),
        });
    }
}

/// Handle used by steps to write container-facing log lines.
///
/// Cloning is cheap; clones share the same sink. [`LogStreamer::with_source`]
/// derives a streamer that tags lines with a different source name.
#[derive(Clone)]
pub struct LogStreamer {
    sink: Arc<dyn LogSink>,
    source_name: String,
}

impl LogStreamer {
    /// Create a streamer writing to `sink` under `source_name`.
    pub fn new(sink: Arc<dyn LogSink>, source_name: impl Into<String>) -> Self {
        Self {
            sink,
            source_name: source_name.into(),
        }
    }

    /// A streamer that discards everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(NullLogSink), "")
    }

    /// Derive a streamer tagged with `source_name`. An empty name keeps the current one.
    pub fn with_source(&self, source_name: &str) -> Self {
        if source_name.is_empty() {
            return self.clone();
        }
        Self {
            sink: Arc::clone(&self.sink),
            source_name: source_name.to_string(),
        }
    }

    /// The source name lines are tagged with.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Write a line to stdout.
    pub fn stdout(&self, message: &str) {
        self.sink
            .write(&self.source_name, OutputStream::Stdout, message);
    }

    /// Write a line to stderr.
    pub fn stderr(&self, message: &str) {
        self.sink
            .write(&self.source_name, OutputStream::Stderr, message);
    }
}

impl fmt::Debug for LogStreamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStreamer")
            .field("source_name", &self.source_name)
            .finish_non_exhaustive()
    }
}
