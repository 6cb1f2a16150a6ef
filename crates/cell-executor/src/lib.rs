// cell-executor: Per-host container execution core.
// Depends on `cell-sdk` and `cell-common`.
//
// Architecture:
//   ContainerStore::reserve → create (DependencyManager → backend create)
//     → run (Transformer::steps_runner → StepRunner::run) → stop / destroy
//   ContainerReaper::run reconciles the store's NodeMap with the backend.

pub mod action;
pub mod cache;
pub mod container;
pub mod container_store;
pub mod dependency_manager;
pub mod started_signal;
pub mod step_runner;
pub mod steps;
pub mod transformer;

#[cfg(test)]
pub mod test_support;

pub use action::Action;
pub use container_store::{ContainerReaper, ContainerStore, ContainerStoreError};
pub use dependency_manager::{BindMounts, CacheKeyDir, DependencyError, DependencyManager};
pub use step_runner::StepRunner;
pub use steps::{Step, StepError};
pub use transformer::{StepContext, TransformError, Transformer};
