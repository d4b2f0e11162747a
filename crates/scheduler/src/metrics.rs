use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use kiln_core::SchedulingStrategy;

/// Incremental mean: `prev + (sample - prev) / count`.
fn rolling_mean(prev: Duration, sample: Duration, count: u64) -> Duration {
    if count <= 1 {
        return sample;
    }
    let prev_nanos = prev.as_nanos() as f64;
    let cur_nanos = sample.as_nanos() as f64;
    let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
    Duration::from_nanos(avg_nanos as u64)
}

/// Execution statistics for one task type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeStats {
    /// Runs that reached a terminal outcome (success or failure).
    pub executed: u64,
    pub failed: u64,
    pub avg_duration: Duration,
    pub last_run: Option<DateTime<Utc>>,
}

impl TypeStats {
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.executed += 1;
        if !success {
            self.failed += 1;
        }
        self.avg_duration = rolling_mean(self.avg_duration, duration, self.executed);
        self.last_run = Some(Utc::now());
    }

    /// Fold another instance's stats for the same type into this one.
    pub fn merge(&mut self, other: &TypeStats) {
        let total = self.executed + other.executed;
        if total > 0 {
            let weighted = self.avg_duration.as_nanos() as f64 * self.executed as f64
                + other.avg_duration.as_nanos() as f64 * other.executed as f64;
            self.avg_duration = Duration::from_nanos((weighted / total as f64) as u64);
        }
        self.executed = total;
        self.failed += other.failed;
        self.last_run = self.last_run.max(other.last_run);
    }
}

/// Operational metrics of one scheduler instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetrics {
    pub instance_id: String,
    pub strategy: SchedulingStrategy,
    /// Gauges, refreshed on every tick and on read.
    pub queue_size: usize,
    pub active_tasks: usize,
    pub max_concurrent_tasks: usize,
    /// `active_tasks / max_concurrent_tasks`.
    pub utilization: f64,
    pub resource_count: usize,
    /// Counters, never reset by the sweep.
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub avg_execution_time: Duration,
    pub by_type: HashMap<String, TypeStats>,
    pub last_tick: Option<DateTime<Utc>>,
}

impl InstanceMetrics {
    pub fn new(instance_id: impl Into<String>, strategy: SchedulingStrategy, max_concurrent_tasks: usize) -> Self {
        Self {
            instance_id: instance_id.into(),
            strategy,
            queue_size: 0,
            active_tasks: 0,
            max_concurrent_tasks,
            utilization: 0.0,
            resource_count: 0,
            submitted: 0,
            rejected: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            timed_out: 0,
            avg_execution_time: Duration::ZERO,
            by_type: HashMap::new(),
            last_tick: None,
        }
    }

    /// Record a finished work unit.
    pub fn record_execution(&mut self, task_type: &str, duration: Duration, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        let runs = self.by_type.values().map(|s| s.executed).sum::<u64>() + 1;
        self.avg_execution_time = rolling_mean(self.avg_execution_time, duration, runs);
        self.by_type
            .entry(task_type.to_string())
            .or_default()
            .record(duration, success);
    }

    pub fn set_gauges(&mut self, queue_size: usize, active_tasks: usize, resource_count: usize) {
        self.queue_size = queue_size;
        self.active_tasks = active_tasks;
        self.resource_count = resource_count;
        self.utilization = if self.max_concurrent_tasks == 0 {
            0.0
        } else {
            active_tasks as f64 / self.max_concurrent_tasks as f64
        };
    }
}

/// Read-only snapshot across all instances of a multiplexer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_instances: usize,
    pub active_tasks: usize,
    /// Mean of per-instance utilization; 0.0 with no instances.
    pub average_utilization: f64,
    pub queue_size: usize,
    pub submitted_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
}

impl SystemMetrics {
    pub fn aggregate<'a>(instances: impl IntoIterator<Item = &'a InstanceMetrics>) -> Self {
        let mut out = SystemMetrics::default();
        let mut utilization_sum = 0.0;
        for m in instances {
            out.total_instances += 1;
            out.active_tasks += m.active_tasks;
            out.queue_size += m.queue_size;
            out.submitted_tasks += m.submitted;
            out.completed_tasks += m.completed;
            out.failed_tasks += m.failed;
            out.cancelled_tasks += m.cancelled;
            utilization_sum += m.utilization;
        }
        if out.total_instances > 0 {
            out.average_utilization = utilization_sum / out.total_instances as f64;
        }
        out
    }
}

/// Loop timings gathered while profiling is enabled.
#[derive(Debug, Clone, Default)]
pub struct ProfileStats {
    ticks: u64,
    total_tick: Duration,
    max_tick: Duration,
    dispatched: u64,
    total_queue_wait: Duration,
    executions: u64,
    total_execution: Duration,
}

impl ProfileStats {
    pub fn record_tick(&mut self, elapsed: Duration, dispatched: usize) {
        self.ticks += 1;
        self.total_tick += elapsed;
        self.max_tick = self.max_tick.max(elapsed);
        self.dispatched += dispatched as u64;
    }

    pub fn record_queue_wait(&mut self, wait: Duration) {
        self.total_queue_wait += wait;
    }

    pub fn record_execution(&mut self, elapsed: Duration) {
        self.executions += 1;
        self.total_execution += elapsed;
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        fn avg_ms(total: Duration, n: u64) -> f64 {
            if n == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1000.0 / n as f64
            }
        }
        let mut map = BTreeMap::new();
        map.insert("ticks".to_string(), self.ticks as f64);
        map.insert("avg_tick_ms".to_string(), avg_ms(self.total_tick, self.ticks));
        map.insert("max_tick_ms".to_string(), self.max_tick.as_secs_f64() * 1000.0);
        map.insert("dispatched".to_string(), self.dispatched as f64);
        map.insert(
            "avg_queue_wait_ms".to_string(),
            avg_ms(self.total_queue_wait, self.dispatched),
        );
        map.insert("executions".to_string(), self.executions as f64);
        map.insert(
            "avg_execution_ms".to_string(),
            avg_ms(self.total_execution, self.executions),
        );
        map
    }
}
