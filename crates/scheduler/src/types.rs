use std::time::Duration;

use serde::{Deserialize, Serialize};

use kiln_core::{KilnError, SchedulingStrategy, Task};

use crate::registry::ResourceInfo;

/// Per-instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance id, unique within a multiplexer.
    pub id: String,
    #[serde(default)]
    pub strategy: SchedulingStrategy,
    /// Maximum number of QUEUED tasks waiting for placement.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Maximum number of tasks holding a slot at once.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Placement timeout for tasks that carry none. `None` waits forever.
    #[serde(default)]
    pub default_timeout: Option<Duration>,
    /// Background loop interval.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// How long terminal tasks stay queryable before the sweep.
    #[serde(default = "default_retention")]
    pub retention: Duration,
    /// How long a suspended RUNNING task may hold its slot.
    #[serde(default = "default_suspend_grace")]
    pub suspend_grace: Duration,
    /// Final statuses remembered after the sweep, for dependency checks.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_max_queue_size() -> usize { 1000 }
fn default_max_concurrent_tasks() -> usize { 4 }
fn default_tick_interval() -> Duration { Duration::from_millis(100) }
fn default_retention() -> Duration { Duration::from_secs(60) }
fn default_suspend_grace() -> Duration { Duration::from_secs(30) }
fn default_history_capacity() -> usize { 4096 }

impl Default for InstanceConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InstanceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            strategy: SchedulingStrategy::default(),
            max_queue_size: default_max_queue_size(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_timeout: None,
            tick_interval: default_tick_interval(),
            retention: default_retention(),
            suspend_grace: default_suspend_grace(),
            history_capacity: default_history_capacity(),
        }
    }

    pub fn strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn suspend_grace(mut self, grace: Duration) -> Self {
        self.suspend_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), KilnError> {
        if self.id.trim().is_empty() {
            return Err(KilnError::Config("instance id must not be empty".into()));
        }
        if self.max_queue_size == 0 {
            return Err(KilnError::Config(format!(
                "instance {}: max_queue_size must be positive",
                self.id
            )));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(KilnError::Config(format!(
                "instance {}: max_concurrent_tasks must be positive",
                self.id
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(KilnError::Config(format!(
                "instance {}: tick_interval must be positive",
                self.id
            )));
        }
        if self.history_capacity == 0 {
            return Err(KilnError::Config(format!(
                "instance {}: history_capacity must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// Scoring hook for [`SchedulingStrategy::Custom`].
///
/// Called once per eligible resource for each task being placed; the highest
/// score wins and ties go to the earliest registered resource.
pub trait ResourceScorer: Send + Sync {
    fn score(&self, task: &Task, resource: &ResourceInfo) -> f64;
}

impl<F> ResourceScorer for F
where
    F: Fn(&Task, &ResourceInfo) -> f64 + Send + Sync,
{
    fn score(&self, task: &Task, resource: &ResourceInfo) -> f64 {
        self(task, resource)
    }
}

/// What one pass of the background loop did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Tasks moved from QUEUED to RUNNING on a freshly reserved slot.
    pub dispatched: usize,
    /// Resumed tasks that still held their slot and went straight back to RUNNING.
    pub promoted: usize,
    /// Suspended tasks whose slot was released after the grace period.
    pub slots_released: usize,
    /// Queued tasks failed with `NoResourceAvailable`.
    pub timed_out: usize,
    /// Queued tasks failed because a dependency did not complete.
    pub dependency_failed: usize,
    /// Running tasks newly flagged as past their timeout.
    pub overdue: usize,
    /// Terminal tasks removed from the live maps.
    pub swept: usize,
}
