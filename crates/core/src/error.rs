use thiserror::Error;

/// Errors surfaced by the scheduling engine.
///
/// Validation errors are returned synchronously at submission time. Errors
/// discovered by the background loop (timeouts, work failures) are recorded
/// on the task and surface only through its handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KilnError {
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Queue full on instance {instance} (capacity {capacity})")]
    QueueFull { instance: String, capacity: usize },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Instance limit reached ({0})")]
    InstanceLimitReached(usize),

    #[error("No resource available for task {0} before its timeout")]
    NoResourceAvailable(String),

    #[error("Dependency {dependency} of task {task} did not complete")]
    DependencyFailed { task: String, dependency: String },

    #[error("{0}")]
    ExecutionFailure(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl KilnError {
    /// Whether the caller may retry the same submission later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::NoResourceAvailable(_))
    }
}

pub type KilnResult<T> = Result<T, KilnError>;
