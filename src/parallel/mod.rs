//! Parallel story execution.
//!
//! The coordinator hands out isolated execution contexts under leases and
//! bounds how many stories run at once.

pub mod context;
pub mod coordinator;

pub use context::ExecutionContext;
pub use coordinator::{CoordinatorConfig, Integration, WorkerCoordinator};
