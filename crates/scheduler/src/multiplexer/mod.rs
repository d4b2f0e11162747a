//! Multiplexer -- many scheduler instances behind one submission surface.
//!
//! - `core`: instance registry, limits, resource broadcast and aggregation
//! - `routing`: instance selection, task routing and advisory load balancing

mod core;
mod routing;

pub use self::core::Multiplexer;
pub use self::routing::LoadReport;
