use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use kiln_core::{KilnError, Priority, Task, TaskStatus, WorkOutput};

/// Everything a caller can observe about one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub instance_id: String,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub weight: f64,
    /// Resource of the latest dispatch.
    pub resource_id: Option<String>,
    /// Number of dispatches so far.
    pub attempt: u32,
    /// Still running past its timeout.
    pub overdue: bool,
    /// Its resource was unregistered while it held a slot.
    pub orphaned: bool,
    pub error: Option<KilnError>,
    pub output: Option<WorkOutput>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_time: Option<Duration>,
}

impl TaskSnapshot {
    pub(crate) fn for_task(task: &Task, instance_id: &str, status: TaskStatus) -> Self {
        Self {
            task_id: task.id.clone(),
            instance_id: instance_id.to_string(),
            task_type: task.task_type.clone(),
            status,
            priority: task.priority,
            weight: task.weight,
            resource_id: None,
            attempt: 0,
            overdue: false,
            orphaned: false,
            error: None,
            output: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            execution_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }
}

/// Caller-held reference to a submitted task.
///
/// Backed by a `watch` channel that the owning instance updates on every
/// status change, so polling is a cheap borrow and awaiting needs no
/// polling at all.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task_id: String,
    instance_id: String,
    rx: watch::Receiver<TaskSnapshot>,
}

impl TaskHandle {
    pub(crate) fn new(rx: watch::Receiver<TaskSnapshot>) -> Self {
        let (task_id, instance_id) = {
            let snap = rx.borrow();
            (snap.task_id.clone(), snap.instance_id.clone())
        };
        Self {
            task_id,
            instance_id,
            rx,
        }
    }

    /// A handle for a submission that never entered a queue. It is already
    /// FAILED with `error`.
    pub fn rejected(task: &Task, instance_id: &str, error: KilnError) -> Self {
        let mut snap = TaskSnapshot::for_task(task, instance_id, TaskStatus::Failed);
        snap.error = Some(error);
        snap.finished_at = Some(Utc::now());
        let (_tx, rx) = watch::channel(snap);
        Self::new(rx)
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn status(&self) -> TaskStatus {
        self.rx.borrow().status
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.rx.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.rx.borrow().status.is_terminal()
    }

    /// Wait until the task reaches a terminal state.
    ///
    /// If the owning instance goes away first (the task was swept, or the
    /// instance was dropped), returns the last published snapshot.
    pub async fn wait(&mut self) -> TaskSnapshot {
        let reached = self
            .rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map(|snap| snap.clone());
        match reached {
            Ok(snap) => snap,
            Err(_) => self.rx.borrow().clone(),
        }
    }
}
