pub mod config;
pub mod error;
pub mod resource;
pub mod strategy;
pub mod task;

pub use config::EngineConfig;
pub use error::*;
pub use resource::*;
pub use strategy::*;
pub use task::*;
