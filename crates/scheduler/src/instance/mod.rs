//! Scheduler instance -- one bounded queue, one resource registry, one loop.
//!
//! Split into focused submodules:
//! - `core`: instance struct, shared state, resource management and queries
//! - `lifecycle`: submission, cancel/suspend/resume, start and shutdown
//! - `execution`: the background loop tick, dispatch and completion

mod core;
mod execution;
mod lifecycle;
#[cfg(test)]
mod tests;

pub use self::core::SchedulerInstance;
