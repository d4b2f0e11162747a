use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use kiln_core::{KilnError, RoutingStrategy, Task, TaskStatus};

use crate::handle::{TaskHandle, TaskSnapshot};
use crate::instance::SchedulerInstance;

use super::Multiplexer;

/// Instances whose utilization is above this multiple of the mean are overloaded.
const OVERLOAD_FACTOR: f64 = 1.2;
/// Instances whose utilization is below this multiple of the mean are underloaded.
const UNDERLOAD_FACTOR: f64 = 0.8;

/// Result of an advisory load-balance pass. Nothing is migrated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub average_utilization: f64,
    pub overloaded: Vec<String>,
    pub underloaded: Vec<String>,
}

impl LoadReport {
    pub fn is_balanced(&self) -> bool {
        self.overloaded.is_empty() && self.underloaded.is_empty()
    }
}

impl Multiplexer {
    // ── Routing ───────────────────────────────────────────────

    /// Pick the instance the next submission goes to.
    ///
    /// `RoundRobin` rotates through instances in creation order.
    /// `LeastLoaded` takes the lowest utilization, then the shortest queue,
    /// then the earliest created.
    pub fn select_instance(&self) -> Result<Arc<SchedulerInstance>, KilnError> {
        let routing = self.routing_strategy();
        let instances = self.read_instances()?;
        if instances.is_empty() {
            return Err(KilnError::InstanceNotFound("no scheduler instances".into()));
        }

        let picked = match routing {
            RoutingStrategy::RoundRobin => {
                let idx = self.rr_cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
                instances.get_index(idx).map(|(_, i)| Arc::clone(i))
            }
            RoutingStrategy::LeastLoaded => {
                let mut best: Option<(&Arc<SchedulerInstance>, f64, usize)> = None;
                for instance in instances.values() {
                    let load = (instance.utilization(), instance.queue_size());
                    let better = match best {
                        None => true,
                        Some((_, util, queue)) => {
                            load.0 < util || (load.0 == util && load.1 < queue)
                        }
                    };
                    if better {
                        best = Some((instance, load.0, load.1));
                    }
                }
                best.map(|(i, _, _)| Arc::clone(i))
            }
        };
        picked.ok_or_else(|| KilnError::InstanceNotFound("no scheduler instances".into()))
    }

    /// Route a task to an instance and submit it there.
    pub fn submit(&self, task: Task) -> Result<TaskHandle, KilnError> {
        let instance = self.select_instance().inspect_err(|e| {
            warn!(task = %task.id, error = %e, "no instance to route to");
        })?;
        self.submit_on(&instance, task)
    }

    /// Submit to a named instance, bypassing routing.
    pub fn submit_to(&self, instance_id: &str, task: Task) -> Result<TaskHandle, KilnError> {
        let instance = self
            .instance(instance_id)
            .ok_or_else(|| KilnError::InstanceNotFound(instance_id.to_string()))?;
        self.submit_on(&instance, task)
    }

    /// Never fails: routing or admission errors come back as a handle that
    /// is already FAILED.
    pub fn submit_async(&self, task: Task) -> TaskHandle {
        let fallback = task.clone();
        match self.submit(task) {
            Ok(handle) => handle,
            Err(e) => TaskHandle::rejected(&fallback, "", e),
        }
    }

    fn submit_on(&self, instance: &SchedulerInstance, task: Task) -> Result<TaskHandle, KilnError> {
        let task_id = task.id.clone();
        let handle = instance.submit(task)?;
        if let Ok(mut routes) = self.task_routes.lock() {
            routes.put(task_id.clone(), instance.id().to_string());
        }
        debug!(task = %task_id, instance = %instance.id(), "task routed");
        Ok(handle)
    }

    /// The instance holding `task_id`: the remembered route if still valid,
    /// else the first instance that knows the id.
    pub(super) fn locate(&self, task_id: &str) -> Option<Arc<SchedulerInstance>> {
        let routed = self
            .task_routes
            .lock()
            .ok()
            .and_then(|mut routes| routes.get(task_id).cloned());
        if let Some(instance) = routed.and_then(|id| self.instance(&id)) {
            if instance.task_status(task_id).is_some() {
                return Some(instance);
            }
        }
        self.live_instances()
            .into_iter()
            .find(|i| i.task_status(task_id).is_some())
    }

    // ── Task control ──────────────────────────────────────────

    pub fn cancel(&self, task_id: &str) -> bool {
        self.locate(task_id).is_some_and(|i| i.cancel(task_id))
    }

    pub fn suspend(&self, task_id: &str) -> bool {
        self.locate(task_id).is_some_and(|i| i.suspend(task_id))
    }

    pub fn resume(&self, task_id: &str) -> bool {
        self.locate(task_id).is_some_and(|i| i.resume(task_id))
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.locate(task_id)?.task_status(task_id)
    }

    pub fn task_snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.locate(task_id)?.task_snapshot(task_id)
    }

    // ── Load balancing ────────────────────────────────────────

    /// Classify instances against the mean utilization and log the result.
    ///
    /// Advisory only: routing already steers new work, and RUNNING tasks
    /// are never moved between instances.
    pub fn balance_load(&self) -> LoadReport {
        let loads: Vec<(String, f64)> = self
            .live_instances()
            .iter()
            .map(|i| (i.id().to_string(), i.utilization()))
            .collect();
        if loads.is_empty() {
            return LoadReport::default();
        }

        let average = loads.iter().map(|(_, u)| u).sum::<f64>() / loads.len() as f64;
        let mut report = LoadReport {
            average_utilization: average,
            ..LoadReport::default()
        };
        for (id, util) in loads {
            if util > average * OVERLOAD_FACTOR {
                report.overloaded.push(id);
            } else if util < average * UNDERLOAD_FACTOR {
                report.underloaded.push(id);
            }
        }

        if report.is_balanced() {
            debug!(average_utilization = average, "load balanced");
        } else {
            info!(
                average_utilization = average,
                overloaded = ?report.overloaded,
                underloaded = ?report.underloaded,
                "load imbalance detected"
            );
        }
        report
    }
}
