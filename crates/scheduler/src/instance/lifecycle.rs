use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use kiln_core::{KilnError, Task, TaskStatus};

use crate::handle::TaskHandle;
use crate::ticker::PeriodicWorker;

use super::core::TaskEntry;
use super::SchedulerInstance;

impl SchedulerInstance {
    // ── Submission ────────────────────────────────────────────

    /// Validate and enqueue a task.
    ///
    /// Fails fast with `InvalidTask` for a malformed task or an id already
    /// live on this instance, and with `QueueFull` when the queue is at
    /// `max_queue_size`. Never blocks on queue space.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, KilnError> {
        let task_id = task.id.clone();
        match self.enqueue(task) {
            Ok(handle) => {
                self.inner.with_metrics(|m| m.submitted += 1);
                debug!(instance = %self.inner.id, task = %task_id, "task queued");
                Ok(handle)
            }
            Err(e) => {
                self.inner.with_metrics(|m| m.rejected += 1);
                warn!(instance = %self.inner.id, task = %task_id, error = %e, "submission rejected");
                Err(e)
            }
        }
    }

    /// Like [`submit`](Self::submit), but never fails: a rejected
    /// submission comes back as a handle that is already FAILED.
    pub fn submit_async(&self, task: Task) -> TaskHandle {
        let fallback = task.clone();
        match self.submit(task) {
            Ok(handle) => handle,
            Err(e) => TaskHandle::rejected(&fallback, &self.inner.id, e),
        }
    }

    fn enqueue(&self, task: Task) -> Result<TaskHandle, KilnError> {
        task.validate()?;
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(KilnError::Runtime(format!(
                "instance {} is shut down",
                self.inner.id
            )));
        }
        let max_queue_size = self.inner.config().max_queue_size;

        let mut st = self.inner.lock_state()?;
        if st.tasks.contains_key(&task.id) {
            return Err(KilnError::InvalidTask(format!(
                "task id {} is already in use on instance {}",
                task.id, self.inner.id
            )));
        }
        if st.queue.len() >= max_queue_size {
            return Err(KilnError::QueueFull {
                instance: self.inner.id.clone(),
                capacity: max_queue_size,
            });
        }

        st.history.pop(&task.id);
        st.seq += 1;
        let seq = st.seq;
        let task_id = task.id.clone();
        let (mut entry, rx) = TaskEntry::new(task, seq, &self.inner.id);
        entry.transition(TaskStatus::Queued);
        // Dependent tasks start the clock on the tick that finds them placeable.
        if entry.task.dependencies.is_empty() {
            entry.start_placement_clock();
        }
        entry.publish();
        st.queue.push_back(task_id.clone());
        st.tasks.insert(task_id, entry);
        Ok(TaskHandle::new(rx))
    }

    // ── Control ───────────────────────────────────────────────

    /// Cancel a QUEUED or RUNNING task, releasing any slot it holds.
    ///
    /// Returns `false` for unknown, suspended or already-terminal tasks.
    /// A running work unit is only told to stop; it is not interrupted.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut st = match self.inner.lock_state() {
            Ok(st) => st,
            Err(e) => {
                warn!(instance = %self.inner.id, error = %e, "cancel failed");
                return false;
            }
        };
        match st.tasks.get(task_id).map(|e| e.status) {
            Some(TaskStatus::Queued | TaskStatus::Running) => {}
            Some(status) => {
                debug!(instance = %self.inner.id, task = %task_id, status = %status, "cancel ignored");
                return false;
            }
            None => return false,
        }

        st.queue.retain(|q| q != task_id);
        st.release_slot(task_id);
        if let Some(entry) = st.tasks.get_mut(task_id) {
            entry.control.cancel();
            entry.transition(TaskStatus::Cancelled);
            entry.publish();
        }
        drop(st);

        self.inner.with_metrics(|m| m.cancelled += 1);
        info!(instance = %self.inner.id, task = %task_id, "task cancelled");
        true
    }

    /// Suspend a QUEUED or RUNNING task.
    ///
    /// A queued task leaves the queue. A running task keeps its slot for
    /// `suspend_grace`; its work unit sees `is_suspended()` and may park.
    pub fn suspend(&self, task_id: &str) -> bool {
        let Ok(mut st) = self.inner.lock_state() else {
            return false;
        };
        let Some(entry) = st.tasks.get(task_id) else {
            return false;
        };
        if !matches!(entry.status, TaskStatus::Queued | TaskStatus::Running) {
            return false;
        }
        if !entry.holds_slot {
            st.queue.retain(|q| q != task_id);
        }
        let Some(entry) = st.tasks.get_mut(task_id) else {
            return false;
        };
        entry.transition(TaskStatus::Suspended);
        entry.pause_placement_clock();
        entry.suspended_since = Some(Instant::now());
        entry.control.set_suspended(true);
        entry.publish();
        info!(
            instance = %self.inner.id,
            task = %task_id,
            holds_slot = entry.holds_slot,
            "task suspended"
        );
        true
    }

    /// Return a SUSPENDED task to QUEUED.
    ///
    /// A task that still holds its slot is promoted straight back to
    /// RUNNING on the next tick. One whose slot was released goes back in
    /// the queue for a fresh dispatch, which fails if the queue is full.
    /// Its placement clock restarts on the next tick that finds it placeable.
    pub fn resume(&self, task_id: &str) -> bool {
        let max_queue_size = self.inner.config().max_queue_size;
        let Ok(mut st) = self.inner.lock_state() else {
            return false;
        };
        let Some(entry) = st.tasks.get(task_id) else {
            return false;
        };
        if entry.status != TaskStatus::Suspended {
            return false;
        }
        if !entry.holds_slot {
            if st.queue.len() >= max_queue_size {
                warn!(instance = %self.inner.id, task = %task_id, "resume rejected: queue full");
                return false;
            }
            st.queue.push_back(task_id.to_string());
        }
        let Some(entry) = st.tasks.get_mut(task_id) else {
            return false;
        };
        entry.transition(TaskStatus::Queued);
        entry.suspended_since = None;
        entry.control.set_suspended(false);
        entry.publish();
        info!(instance = %self.inner.id, task = %task_id, "task resumed");
        true
    }

    /// Cancel every QUEUED and RUNNING task. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.cancel_matching(|status| matches!(status, TaskStatus::Queued | TaskStatus::Running))
    }

    fn cancel_matching(&self, pick: impl Fn(TaskStatus) -> bool) -> usize {
        let Ok(mut st) = self.inner.lock_state() else {
            return 0;
        };
        let ids: Vec<String> = st
            .tasks
            .values()
            .filter(|e| pick(e.status))
            .map(|e| e.task.id.clone())
            .collect();
        for id in &ids {
            st.queue.retain(|q| q != id);
            st.release_slot(id);
            if let Some(entry) = st.tasks.get_mut(id) {
                entry.control.cancel();
                entry.transition(TaskStatus::Cancelled);
                entry.publish();
            }
        }
        drop(st);

        let cancelled = ids.len();
        if cancelled > 0 {
            self.inner.with_metrics(|m| m.cancelled += cancelled as u64);
        }
        cancelled
    }

    // ── Loop lifecycle ────────────────────────────────────────

    /// Start the background loop. A second call while running is a no-op.
    pub fn start(&self) -> Result<(), KilnError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(KilnError::Runtime(format!(
                "instance {} is shut down",
                self.inner.id
            )));
        }
        let mut worker = self
            .worker
            .lock()
            .map_err(|e| KilnError::LockPoisoned(format!("instance worker: {}", e)))?;
        if worker.as_ref().is_some_and(|w| w.is_running()) {
            return Ok(());
        }

        let interval = self.inner.config().tick_interval;
        let inner = Arc::clone(&self.inner);
        *worker = Some(PeriodicWorker::spawn(
            format!("kiln-{}", self.inner.id),
            interval,
            move || {
                inner.tick();
            },
        )?);
        info!(
            instance = %self.inner.id,
            interval_ms = interval.as_millis() as u64,
            "scheduler loop started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .map(|w| w.as_ref().is_some_and(|w| w.is_running()))
            .unwrap_or(false)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the loop and cancel everything still live, suspended tasks
    /// included. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = match self.worker.lock() {
            Ok(mut w) => w.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(mut worker) = worker {
            worker.stop();
        }
        let cancelled = self.cancel_matching(|status| !status.is_terminal());
        info!(instance = %self.inner.id, cancelled, "scheduler instance shut down");
    }
}
