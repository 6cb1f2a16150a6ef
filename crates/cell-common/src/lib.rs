// cell-common: Shared services and infrastructure for the cell executor.
// Depends on `cell-sdk`; provides settings, logging setup and constants.

pub mod constants;
pub mod logging;
pub mod settings;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use constants::{FailureReason, OWNER_PROPERTY};
pub use logging::init_logging;
pub use settings::{ExecutorSettings, LoggingSettings, SettingsError};
