//! Resource-aware task scheduling engine.
//!
//! A [`SchedulerInstance`] owns one bounded queue, a resource registry and a
//! background loop that places queued tasks on resources. A [`Multiplexer`]
//! routes submissions across many instances, and [`Engine`] wraps one
//! multiplexer behind a flat configuration surface.

pub mod engine;
pub mod handle;
pub mod instance;
pub mod metrics;
pub mod multiplexer;
pub mod registry;
pub mod selection;
pub mod ticker;
pub mod types;

pub use engine::Engine;
pub use handle::{TaskHandle, TaskSnapshot};
pub use instance::SchedulerInstance;
pub use metrics::{InstanceMetrics, SystemMetrics, TypeStats};
pub use multiplexer::{LoadReport, Multiplexer};
pub use registry::{ResourceInfo, ResourceRegistry};
pub use types::{InstanceConfig, ResourceScorer, TickReport};

pub use kiln_core::*;
