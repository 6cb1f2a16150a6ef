// cell-sdk: Foundation layer for the cell executor.
// This crate has no dependencies on other cell crates and provides the
// log streaming, rate limiting and formatting primitives used throughout.

pub mod log_streamer;
pub mod rate_limiter;
pub mod string_util;

// Re-export commonly used items at crate root
pub use log_streamer::{
    CollectingLogSink, LogLine, LogSink, LogStreamer, NullLogSink, OutputStream, TracingLogSink,
};
pub use rate_limiter::{RateLimiter, RateLimiterError};
pub use string_util::{StringUtil, TRUNCATED_MARKER};
