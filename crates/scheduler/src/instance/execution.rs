use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use kiln_core::{
    KilnError, TaskControl, TaskStatus, WorkContext, WorkError, WorkOutput, WorkUnit,
};

use crate::selection::{order_pending, select_resource, PendingTask};
use crate::types::{InstanceConfig, ResourceScorer, TickReport};

use super::core::{Inner, InstanceState};
use super::SchedulerInstance;

/// A placement made under the state lock, spawned once the lock is released.
struct Dispatch {
    task_id: String,
    resource_id: String,
    attempt: u32,
    work: Arc<dyn WorkUnit>,
    control: Arc<TaskControl>,
}

/// How one dispatch of a work unit ended.
pub(super) enum Outcome {
    Completed(WorkOutput),
    Failed(KilnError),
    Cancelled,
}

impl SchedulerInstance {
    /// Run one pass of the background loop on the calling thread.
    ///
    /// The background worker calls this every `tick_interval`; tests call
    /// it directly for deterministic stepping.
    pub fn tick(&self) -> TickReport {
        self.inner.tick()
    }
}

impl Inner {
    pub(super) fn tick(self: &Arc<Self>) -> TickReport {
        let tick_started = Instant::now();
        let config = self.config();
        let scorer = self.scorer.read().ok().and_then(|s| s.clone());
        let mut report = TickReport::default();
        let mut dispatches = Vec::new();

        let (gauges, queue_wait) = {
            let mut guard = match self.lock_state() {
                Ok(g) => g,
                Err(e) => {
                    warn!(instance = %self.id, error = %e, "tick skipped");
                    return report;
                }
            };
            let st = &mut *guard;

            st.resources.refresh();
            promote_resumed(st, &mut report);
            release_expired_suspensions(st, &config, &mut report);
            let queue_wait = dispatch_ready(
                st,
                &config,
                scorer.as_deref(),
                &mut report,
                &mut dispatches,
            );
            fail_unplaceable(st, &config, &mut report);
            flag_overdue(st, &config, &mut report);
            sweep(st, &config, &mut report);

            ((st.queue.len(), st.held_slots, st.resources.len()), queue_wait)
        };

        self.with_metrics(|m| {
            m.set_gauges(gauges.0, gauges.1, gauges.2);
            m.timed_out += report.timed_out as u64;
            m.failed += (report.timed_out + report.dependency_failed) as u64;
            m.last_tick = Some(Utc::now());
        });

        for dispatch in dispatches {
            self.spawn_dispatch(dispatch);
        }

        self.with_profile(|p| {
            p.record_tick(tick_started.elapsed(), report.dispatched);
            p.record_queue_wait(queue_wait);
        });

        if report.dispatched > 0 || report.timed_out > 0 || report.slots_released > 0 {
            debug!(
                instance = %self.id,
                dispatched = report.dispatched,
                promoted = report.promoted,
                timed_out = report.timed_out,
                released = report.slots_released,
                swept = report.swept,
                "tick"
            );
        }
        report
    }

    fn spawn_dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        if self.claim_pool_thread() {
            let inner = Arc::clone(self);
            self.pool.spawn(move || {
                let (task_id, attempt) = (dispatch.task_id.clone(), dispatch.attempt);
                let (outcome, elapsed) = run_work(dispatch);
                inner.pool_busy.fetch_sub(1, Ordering::AcqRel);
                inner.finish(&task_id, attempt, outcome, elapsed);
            });
            return;
        }

        // Pool threads are all inside work units: cancelled ones that have
        // not returned, or a concurrency budget raised past the pool size.
        let (task_id, attempt) = (dispatch.task_id.clone(), dispatch.attempt);
        debug!(instance = %self.id, task = %task_id, "worker pool saturated, using overflow thread");
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-overflow", self.id))
            .spawn(move || {
                let (task_id, attempt) = (dispatch.task_id.clone(), dispatch.attempt);
                let (outcome, elapsed) = run_work(dispatch);
                inner.finish(&task_id, attempt, outcome, elapsed);
            });
        if let Err(e) = spawned {
            let error = KilnError::Runtime(format!("failed to spawn overflow worker: {}", e));
            self.finish(&task_id, attempt, Outcome::Failed(error), Duration::ZERO);
        }
    }

    /// Take a pool thread if one is free of work units.
    fn claim_pool_thread(&self) -> bool {
        self.pool_busy
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |busy| {
                (busy < self.pool_threads).then_some(busy + 1)
            })
            .is_ok()
    }

    /// Record the outcome of one dispatch.
    ///
    /// Completions from a superseded attempt, or for a task that was resumed
    /// after losing its slot, are dropped. A `Cancelled` outcome never ends a
    /// suspended task; it only frees the slot so `resume` re-dispatches.
    pub(super) fn finish(&self, task_id: &str, attempt: u32, outcome: Outcome, elapsed: Duration) {
        let (task_type, status) = {
            let mut st = match self.lock_state() {
                Ok(st) => st,
                Err(e) => {
                    warn!(instance = %self.id, task = %task_id, error = %e, "completion lost");
                    return;
                }
            };
            let Some(entry) = st.tasks.get(task_id) else {
                debug!(instance = %self.id, task = %task_id, "completion for untracked task");
                return;
            };
            if entry.attempt != attempt || entry.status.is_terminal() {
                debug!(instance = %self.id, task = %task_id, attempt, "stale completion ignored");
                return;
            }
            if entry.status == TaskStatus::Queued && !entry.holds_slot {
                debug!(instance = %self.id, task = %task_id, attempt, "completion after resume ignored");
                return;
            }
            if entry.status == TaskStatus::Suspended && matches!(outcome, Outcome::Cancelled) {
                st.release_slot(task_id);
                debug!(instance = %self.id, task = %task_id, "suspended work unit stopped");
                return;
            }

            st.release_slot(task_id);
            let Some(entry) = st.tasks.get_mut(task_id) else {
                return;
            };
            let next = match &outcome {
                Outcome::Completed(_) => TaskStatus::Completed,
                Outcome::Failed(_) => TaskStatus::Failed,
                Outcome::Cancelled => TaskStatus::Cancelled,
            };
            if !entry.transition(next) {
                return;
            }
            entry.execution_time = Some(elapsed);
            entry.suspended_since = None;
            match outcome {
                Outcome::Completed(output) => entry.output = Some(output),
                Outcome::Failed(error) => {
                    warn!(
                        instance = %self.id,
                        task = %task_id,
                        error = %error,
                        "task failed"
                    );
                    entry.error = Some(error);
                }
                Outcome::Cancelled => {}
            }
            entry.publish();
            (entry.task.task_type.clone(), next)
        };

        self.with_metrics(|m| match status {
            TaskStatus::Completed => m.record_execution(&task_type, elapsed, true),
            TaskStatus::Failed => m.record_execution(&task_type, elapsed, false),
            _ => m.cancelled += 1,
        });
        self.with_profile(|p| p.record_execution(elapsed));
        debug!(
            instance = %self.id,
            task = %task_id,
            status = %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "task finished"
        );
    }
}

// ── Tick phases ───────────────────────────────────────────────

/// Resumed tasks that kept their slot go straight back to RUNNING.
fn promote_resumed(st: &mut InstanceState, report: &mut TickReport) {
    for entry in st.tasks.values_mut() {
        if entry.status == TaskStatus::Queued && entry.holds_slot && entry.transition(TaskStatus::Running) {
            entry.publish();
            report.promoted += 1;
        }
    }
}

/// Suspended tasks past the grace period lose their slot and their work
/// unit is told to stop.
fn release_expired_suspensions(st: &mut InstanceState, config: &InstanceConfig, report: &mut TickReport) {
    let expired: Vec<String> = st
        .tasks
        .values()
        .filter(|e| {
            e.status == TaskStatus::Suspended
                && e.holds_slot
                && e.suspended_since
                    .is_some_and(|since| since.elapsed() >= config.suspend_grace)
        })
        .map(|e| e.task.id.clone())
        .collect();

    for id in expired {
        st.release_slot(&id);
        if let Some(entry) = st.tasks.get_mut(&id) {
            entry.control.cancel();
            entry.publish();
        }
        warn!(task = %id, grace_ms = config.suspend_grace.as_millis() as u64, "suspended task released its slot");
        report.slots_released += 1;
    }
}

/// Fail queued tasks whose dependency ended FAILED or CANCELLED, or that
/// stayed placeable and unplaced past their timeout. Runs after dispatch,
/// so a task placed this tick is never timed out.
fn fail_unplaceable(st: &mut InstanceState, config: &InstanceConfig, report: &mut TickReport) {
    let mut failures: Vec<(String, KilnError)> = Vec::new();
    let mut placeable: Vec<String> = Vec::new();
    for id in &st.queue {
        let Some(entry) = st.tasks.get(id) else {
            continue;
        };
        let broken = entry.task.dependencies.iter().find(|dep| {
            matches!(
                st.status_of(dep),
                Some(TaskStatus::Failed | TaskStatus::Cancelled)
            )
        });
        if let Some(dep) = broken {
            failures.push((
                id.clone(),
                KilnError::DependencyFailed {
                    task: id.clone(),
                    dependency: dep.to_string(),
                },
            ));
            continue;
        }
        let ready = entry
            .task
            .dependencies
            .iter()
            .all(|dep| st.status_of(dep) == Some(TaskStatus::Completed));
        // Placement timeout only covers the wait for a first dispatch.
        if ready && entry.attempt == 0 {
            placeable.push(id.clone());
        }
    }

    for id in placeable {
        let Some(entry) = st.tasks.get_mut(&id) else {
            continue;
        };
        entry.start_placement_clock();
        let Some(limit) = entry.timeout(config.default_timeout) else {
            continue;
        };
        if entry.placement_wait() >= limit {
            failures.push((id.clone(), KilnError::NoResourceAvailable(id)));
        }
    }

    for (id, error) in failures {
        st.queue.retain(|q| q != &id);
        match error {
            KilnError::NoResourceAvailable(_) => report.timed_out += 1,
            _ => report.dependency_failed += 1,
        }
        warn!(task = %id, error = %error, "queued task failed");
        if let Some(entry) = st.tasks.get_mut(&id) {
            if entry.transition(TaskStatus::Failed) {
                entry.pause_placement_clock();
                entry.error = Some(error);
                entry.publish();
            }
        }
    }
}

/// Place ready tasks on resources while the concurrency budget allows.
/// Returns the total queue wait of the tasks dispatched.
fn dispatch_ready(
    st: &mut InstanceState,
    config: &InstanceConfig,
    scorer: Option<&dyn ResourceScorer>,
    report: &mut TickReport,
    dispatches: &mut Vec<Dispatch>,
) -> Duration {
    let mut pending: Vec<PendingTask> = st
        .queue
        .iter()
        .filter_map(|id| st.tasks.get(id))
        .filter(|e| {
            e.task
                .dependencies
                .iter()
                .all(|dep| st.status_of(dep) == Some(TaskStatus::Completed))
        })
        .map(|e| PendingTask {
            id: e.task.id.clone(),
            priority: e.task.priority,
            weight: e.task.weight,
            seq: e.seq,
        })
        .collect();
    order_pending(config.strategy, &mut pending);

    let mut queue_wait = Duration::ZERO;
    for next in pending {
        if st.held_slots >= config.max_concurrent_tasks {
            break;
        }
        let candidates = st.resources.available();
        if candidates.is_empty() {
            break;
        }
        let Some(entry) = st.tasks.get(&next.id) else {
            continue;
        };
        let Some(work) = entry.task.work.clone() else {
            continue;
        };
        let Some(idx) = select_resource(
            config.strategy,
            &entry.task,
            &candidates,
            scorer,
            &mut st.rr_cursor,
        ) else {
            break;
        };
        let resource_id = candidates[idx].id.clone();
        if let Err(e) = st.resources.reserve(&resource_id) {
            warn!(task = %next.id, resource = %resource_id, error = %e, "reservation failed");
            continue;
        }
        st.held_slots += 1;
        st.queue.retain(|q| q != &next.id);

        let Some(entry) = st.tasks.get_mut(&next.id) else {
            continue;
        };
        entry.attempt += 1;
        entry.holds_slot = true;
        entry.orphaned = false;
        entry.resource_id = Some(resource_id.clone());
        entry.control = Arc::new(TaskControl::new());
        entry.started_at = Some(Utc::now());
        entry.started = Some(Instant::now());
        entry.pause_placement_clock();
        entry.transition(TaskStatus::Running);
        entry.publish();
        queue_wait += entry.submitted.elapsed();

        info!(
            instance = %entry.instance_id,
            task = %next.id,
            resource = %resource_id,
            attempt = entry.attempt,
            "task dispatched"
        );
        dispatches.push(Dispatch {
            task_id: next.id,
            resource_id,
            attempt: entry.attempt,
            work,
            control: Arc::clone(&entry.control),
        });
        report.dispatched += 1;
    }
    queue_wait
}

/// Flag RUNNING tasks whose latest dispatch is older than their timeout.
/// Advisory only.
fn flag_overdue(st: &mut InstanceState, config: &InstanceConfig, report: &mut TickReport) {
    for entry in st.tasks.values_mut() {
        if entry.status != TaskStatus::Running || entry.overdue {
            continue;
        }
        let Some(limit) = entry.timeout(config.default_timeout) else {
            continue;
        };
        if entry.started.is_some_and(|started| started.elapsed() > limit) {
            entry.overdue = true;
            entry.publish();
            warn!(
                instance = %entry.instance_id,
                task = %entry.task.id,
                timeout_ms = limit.as_millis() as u64,
                "running task is overdue"
            );
            report.overdue += 1;
        }
    }
}

/// Move terminal tasks older than the retention window into the history.
fn sweep(st: &mut InstanceState, config: &InstanceConfig, report: &mut TickReport) {
    let expired: Vec<String> = st
        .tasks
        .values()
        .filter(|e| {
            e.status.is_terminal()
                && e.finished
                    .is_some_and(|finished| finished.elapsed() >= config.retention)
        })
        .map(|e| e.task.id.clone())
        .collect();
    for id in expired {
        if let Some(entry) = st.tasks.remove(&id) {
            st.history.put(id, entry.status);
            report.swept += 1;
        }
    }
}

/// Run one work unit to its outcome, catching panics.
fn run_work(dispatch: Dispatch) -> (Outcome, Duration) {
    let Dispatch {
        task_id,
        resource_id,
        attempt,
        work,
        control,
    } = dispatch;
    let ctx = WorkContext::new(task_id, resource_id, attempt, control);
    let started = Instant::now();

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work.execute(&ctx))) {
        Ok(Ok(output)) => Outcome::Completed(output),
        Ok(Err(WorkError::Failed(message))) => Outcome::Failed(KilnError::ExecutionFailure(message)),
        Ok(Err(WorkError::Cancelled)) => Outcome::Cancelled,
        Err(payload) => Outcome::Failed(KilnError::ExecutionFailure(panic_message(payload.as_ref()))),
    };
    (outcome, started.elapsed())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "work unit panicked".to_string()
    }
}
