use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::KilnError;

/// Task priority. Higher variants are more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
    Urgent = 4,
}

impl Priority {
    /// Numeric value used as a selection score.
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Lifecycle state of a submitted task.
///
/// ```text
/// Pending -> Queued -> Running -> Completed | Failed | Cancelled
///              ^  \       |
///              |   `-> Suspended <-'
///              `--------'
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Suspended,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Queued and Suspended may reach Completed/Failed directly when a work
    /// unit that still holds its slot finishes before the loop promotes it
    /// back to Running. Nothing ever re-enters Pending.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Running | Suspended | Cancelled | Failed | Completed) => true,
            (Running, Completed | Failed | Cancelled | Suspended) => true,
            (Suspended, Queued | Cancelled | Completed | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Queued => write!(f, "QUEUED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Cancelled => write!(f, "CANCELLED"),
            TaskStatus::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

// ── Work units ────────────────────────────────────────────────

/// What a work unit reports back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkOutput {
    /// Items processed (tokens generated, elements copied, ...).
    pub items_processed: usize,
    /// Optional human-readable summary or payload.
    pub summary: Option<String>,
}

impl WorkOutput {
    pub fn items(items_processed: usize) -> Self {
        Self {
            items_processed,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Error returned by a work unit.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
}

/// Cooperative control flags shared between the scheduler and one dispatch
/// of a work unit.
#[derive(Debug, Default)]
pub struct TaskControl {
    cancelled: AtomicBool,
    suspended: AtomicBool,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

/// Execution context handed to [`WorkUnit::execute`].
///
/// Cancellation and suspension are cooperative: a work unit that never
/// polls these flags runs to completion.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub task_id: String,
    pub resource_id: String,
    /// Dispatch attempt, starting at 1.
    pub attempt: u32,
    control: Arc<TaskControl>,
}

impl WorkContext {
    pub fn new(
        task_id: impl Into<String>,
        resource_id: impl Into<String>,
        attempt: u32,
        control: Arc<TaskControl>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            resource_id: resource_id.into(),
            attempt,
            control,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn is_suspended(&self) -> bool {
        self.control.is_suspended()
    }

    /// Park while the task is suspended. Returns `false` if the task was
    /// cancelled while parked (or before), `true` once it may continue.
    pub fn wait_while_suspended(&self, poll: Duration) -> bool {
        while self.control.is_suspended() && !self.control.is_cancelled() {
            std::thread::sleep(poll);
        }
        !self.control.is_cancelled()
    }
}

/// The opaque unit of work carried by a [`Task`].
///
/// The scheduler never inspects what the work does, only the task metadata.
pub trait WorkUnit: Send + Sync {
    fn execute(&self, ctx: &WorkContext) -> Result<WorkOutput, WorkError>;
}

impl<F> WorkUnit for F
where
    F: Fn(&WorkContext) -> Result<WorkOutput, WorkError> + Send + Sync,
{
    fn execute(&self, ctx: &WorkContext) -> Result<WorkOutput, WorkError> {
        self(ctx)
    }
}

/// Wrap a closure as a shared work unit.
pub fn work_fn<F>(f: F) -> Arc<dyn WorkUnit>
where
    F: Fn(&WorkContext) -> Result<WorkOutput, WorkError> + Send + Sync + 'static,
{
    Arc::new(f)
}

// ── Task ──────────────────────────────────────────────────────

/// One schedulable unit. Immutable after submission; the scheduler tracks
/// its status separately.
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    /// Weight in [0, 1], used by the weighted strategy.
    pub weight: f64,
    /// Maximum time to wait for placement. `None` defers to the instance default.
    pub timeout: Option<Duration>,
    /// Ids of tasks in the same instance that must complete first.
    pub dependencies: Vec<String>,
    pub parameters: HashMap<String, String>,
    pub work: Option<Arc<dyn WorkUnit>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, work: Arc<dyn WorkUnit>) -> Self {
        Self {
            id: id.into(),
            task_type: "generic".to_string(),
            priority: Priority::Normal,
            weight: 0.5,
            timeout: None,
            dependencies: Vec::new(),
            parameters: HashMap::new(),
            work: Some(work),
            created_at: Utc::now(),
        }
    }

    /// Create a task with a random v4 id.
    pub fn with_generated_id(work: Arc<dyn WorkUnit>) -> Self {
        Self::new(Uuid::new_v4().to_string(), work)
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Check the submission invariants: non-empty id, work present, weight in [0, 1].
    pub fn validate(&self) -> Result<(), KilnError> {
        if self.id.trim().is_empty() {
            return Err(KilnError::InvalidTask("task id must not be empty".into()));
        }
        if self.work.is_none() {
            return Err(KilnError::InvalidTask(format!(
                "task {} has no work unit",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.weight) {
            return Err(KilnError::InvalidTask(format!(
                "task {} weight {} outside [0, 1]",
                self.id, self.weight
            )));
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(KilnError::InvalidTask(format!(
                "task {} depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("timeout", &self.timeout)
            .field("dependencies", &self.dependencies)
            .field("work", &self.work.as_ref().map(|_| "<work>"))
            .field("created_at", &self.created_at)
            .finish()
    }
}
