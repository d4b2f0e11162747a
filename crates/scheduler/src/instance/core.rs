use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::watch;
use tracing::{info, warn};

use kiln_core::{
    KilnError, ResourceProvider, SchedulingStrategy, Task, TaskControl, TaskStatus, WorkOutput,
};

use crate::handle::TaskSnapshot;
use crate::metrics::{InstanceMetrics, ProfileStats};
use crate::registry::{ResourceInfo, ResourceRegistry};
use crate::ticker::PeriodicWorker;
use crate::types::{InstanceConfig, ResourceScorer};

// ── Task records ──────────────────────────────────────────────

/// Live record of one submitted task.
pub(super) struct TaskEntry {
    pub(super) task: Task,
    pub(super) instance_id: String,
    pub(super) status: TaskStatus,
    /// Arrival order within the instance.
    pub(super) seq: u64,
    pub(super) resource_id: Option<String>,
    /// Holds one instance concurrency slot and one unit of `resource_id`.
    pub(super) holds_slot: bool,
    pub(super) attempt: u32,
    /// Flags for the current dispatch; replaced on every dispatch.
    pub(super) control: Arc<TaskControl>,
    pub(super) submitted: Instant,
    pub(super) submitted_at: DateTime<Utc>,
    pub(super) started_at: Option<DateTime<Utc>>,
    /// Latest dispatch; the overdue check measures from here.
    pub(super) started: Option<Instant>,
    /// Running while the task is QUEUED with its dependencies met.
    pub(super) queued_since: Option<Instant>,
    /// Placement wait banked before the last suspension.
    pub(super) placement_wait: Duration,
    pub(super) finished: Option<Instant>,
    pub(super) finished_at: Option<DateTime<Utc>>,
    pub(super) suspended_since: Option<Instant>,
    pub(super) overdue: bool,
    pub(super) orphaned: bool,
    pub(super) error: Option<KilnError>,
    pub(super) output: Option<WorkOutput>,
    pub(super) execution_time: Option<Duration>,
    notify: watch::Sender<TaskSnapshot>,
}

impl TaskEntry {
    pub(super) fn new(task: Task, seq: u64, instance_id: &str) -> (Self, watch::Receiver<TaskSnapshot>) {
        let snapshot = TaskSnapshot::for_task(&task, instance_id, TaskStatus::Pending);
        let submitted_at = snapshot.submitted_at;
        let (notify, rx) = watch::channel(snapshot);
        let entry = Self {
            task,
            instance_id: instance_id.to_string(),
            status: TaskStatus::Pending,
            seq,
            resource_id: None,
            holds_slot: false,
            attempt: 0,
            control: Arc::new(TaskControl::new()),
            submitted: Instant::now(),
            submitted_at,
            started_at: None,
            started: None,
            queued_since: None,
            placement_wait: Duration::ZERO,
            finished: None,
            finished_at: None,
            suspended_since: None,
            overdue: false,
            orphaned: false,
            error: None,
            output: None,
            execution_time: None,
            notify,
        };
        (entry, rx)
    }

    /// Apply a state-machine transition. Returns `false` (and changes
    /// nothing) if the edge is not allowed.
    pub(super) fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                instance = %self.instance_id,
                task = %self.task.id,
                from = %self.status,
                to = %next,
                "illegal status transition ignored"
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished = Some(Instant::now());
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub(super) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task.id.clone(),
            instance_id: self.instance_id.clone(),
            task_type: self.task.task_type.clone(),
            status: self.status,
            priority: self.task.priority,
            weight: self.task.weight,
            resource_id: self.resource_id.clone(),
            attempt: self.attempt,
            overdue: self.overdue,
            orphaned: self.orphaned,
            error: self.error.clone(),
            output: self.output.clone(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            execution_time: self.execution_time,
        }
    }

    /// Push the current state to every handle.
    pub(super) fn publish(&self) {
        self.notify.send_replace(self.snapshot());
    }

    /// Placement timeout: the task's own, else the instance default.
    pub(super) fn timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.task.timeout.or(default)
    }

    pub(super) fn start_placement_clock(&mut self) {
        if self.queued_since.is_none() {
            self.queued_since = Some(Instant::now());
        }
    }

    pub(super) fn pause_placement_clock(&mut self) {
        if let Some(since) = self.queued_since.take() {
            self.placement_wait += since.elapsed();
        }
    }

    /// Time spent QUEUED and placeable, excluding suspensions and
    /// waits on unfinished dependencies.
    pub(super) fn placement_wait(&self) -> Duration {
        self.placement_wait + self.queued_since.map_or(Duration::ZERO, |since| since.elapsed())
    }
}

/// Everything the loop and the public calls mutate, behind one lock.
pub(super) struct InstanceState {
    /// Ids of QUEUED tasks awaiting a fresh dispatch.
    pub(super) queue: VecDeque<String>,
    pub(super) tasks: HashMap<String, TaskEntry>,
    pub(super) resources: ResourceRegistry,
    /// Number of tasks holding a concurrency slot.
    pub(super) held_slots: usize,
    pub(super) rr_cursor: usize,
    /// Final status of swept tasks.
    pub(super) history: LruCache<String, TaskStatus>,
    pub(super) seq: u64,
}

impl InstanceState {
    /// Status of a live task, falling back to the swept history.
    pub(super) fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .get(task_id)
            .map(|e| e.status)
            .or_else(|| self.history.peek(task_id).copied())
    }

    /// Give back the task's concurrency slot and resource unit, if it holds them.
    pub(super) fn release_slot(&mut self, task_id: &str) {
        let Some(entry) = self.tasks.get_mut(task_id) else {
            return;
        };
        if !entry.holds_slot {
            return;
        }
        entry.holds_slot = false;
        self.held_slots = self.held_slots.saturating_sub(1);
        if entry.orphaned {
            return;
        }
        if let Some(resource_id) = &entry.resource_id {
            self.resources.release(resource_id);
        }
    }
}

/// State shared between the instance, its loop thread and its work threads.
pub(super) struct Inner {
    pub(super) id: String,
    pub(super) config: RwLock<InstanceConfig>,
    pub(super) state: Mutex<InstanceState>,
    pub(super) metrics: RwLock<InstanceMetrics>,
    pub(super) profile: Mutex<ProfileStats>,
    pub(super) profiling: AtomicBool,
    pub(super) scorer: RwLock<Option<Arc<dyn ResourceScorer>>>,
    pub(super) shutdown: AtomicBool,
    pub(super) pool: rayon::ThreadPool,
    pub(super) pool_threads: usize,
    /// Pool jobs spawned and not yet past their work unit.
    pub(super) pool_busy: AtomicUsize,
}

impl Inner {
    pub(super) fn lock_state(&self) -> Result<MutexGuard<'_, InstanceState>, KilnError> {
        self.state
            .lock()
            .map_err(|e| KilnError::LockPoisoned(format!("instance {} state: {}", self.id, e)))
    }

    pub(super) fn config(&self) -> InstanceConfig {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut InstanceMetrics)) {
        if let Ok(mut m) = self.metrics.write() {
            f(&mut m);
        }
    }

    pub(super) fn with_profile(&self, f: impl FnOnce(&mut ProfileStats)) {
        if !self.profiling.load(Ordering::Relaxed) {
            return;
        }
        if let Ok(mut p) = self.profile.lock() {
            f(&mut p);
        }
    }
}

// ── SchedulerInstance ─────────────────────────────────────────

/// One scheduler instance: a bounded queue, a resource registry and a
/// background loop placing queued tasks on resources.
///
/// Work units run on a dedicated rayon pool sized to the initial
/// `max_concurrent_tasks`. A cancelled unit that ignores the request keeps
/// its pool thread after its slot is freed, so once every pool thread is
/// taken further dispatches get their own overflow thread. The loop never
/// waits for work units.
pub struct SchedulerInstance {
    pub(super) inner: Arc<Inner>,
    pub(super) worker: Mutex<Option<PeriodicWorker>>,
}

impl SchedulerInstance {
    /// Create an instance. The background loop is not started; call
    /// [`start`](Self::start) or drive it with [`tick`](Self::tick).
    pub fn new(config: InstanceConfig) -> Result<Self, KilnError> {
        config.validate()?;
        let history_capacity = NonZeroUsize::new(config.history_capacity)
            .ok_or_else(|| KilnError::Config("history_capacity must be positive".into()))?;

        let pool_threads = config.max_concurrent_tasks;
        let thread_prefix = config.id.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_threads)
            .thread_name(move |i| format!("{}-work-{}", thread_prefix, i))
            .build()
            .map_err(|e| KilnError::Runtime(format!("failed to build worker pool: {}", e)))?;

        let metrics = InstanceMetrics::new(&config.id, config.strategy, config.max_concurrent_tasks);
        info!(
            instance = %config.id,
            strategy = %config.strategy,
            max_queue = config.max_queue_size,
            max_concurrent = config.max_concurrent_tasks,
            "scheduler instance created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                id: config.id.clone(),
                state: Mutex::new(InstanceState {
                    queue: VecDeque::new(),
                    tasks: HashMap::new(),
                    resources: ResourceRegistry::new(),
                    held_slots: 0,
                    rr_cursor: 0,
                    history: LruCache::new(history_capacity),
                    seq: 0,
                }),
                config: RwLock::new(config),
                metrics: RwLock::new(metrics),
                profile: Mutex::new(ProfileStats::default()),
                profiling: AtomicBool::new(false),
                scorer: RwLock::new(None),
                shutdown: AtomicBool::new(false),
                pool,
                pool_threads,
                pool_busy: AtomicUsize::new(0),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> InstanceConfig {
        self.inner.config()
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.inner.config().strategy
    }

    /// Switch the selection strategy. Applies from the next tick.
    pub fn set_strategy(&self, strategy: SchedulingStrategy) {
        if let Ok(mut c) = self.inner.config.write() {
            c.strategy = strategy;
        }
        self.inner.with_metrics(|m| m.strategy = strategy);
        info!(instance = %self.id(), strategy = %strategy, "strategy changed");
    }

    /// Change the queue bound. Fails if it would drop below the current length.
    pub fn set_max_queue_size(&self, max_queue_size: usize) -> Result<(), KilnError> {
        if max_queue_size == 0 {
            return Err(KilnError::Config("max_queue_size must be positive".into()));
        }
        let st = self.inner.lock_state()?;
        if max_queue_size < st.queue.len() {
            return Err(KilnError::Config(format!(
                "instance {} has {} queued tasks, cannot shrink queue to {}",
                self.id(),
                st.queue.len(),
                max_queue_size
            )));
        }
        let mut c = self
            .inner
            .config
            .write()
            .map_err(|e| KilnError::LockPoisoned(format!("instance config: {}", e)))?;
        c.max_queue_size = max_queue_size;
        Ok(())
    }

    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        if let Ok(mut c) = self.inner.config.write() {
            c.default_timeout = timeout;
        }
    }

    /// Replace the whole configuration at once.
    ///
    /// The id cannot change and the queue bound cannot drop below the
    /// current queue length. A new `tick_interval` restarts a running loop.
    /// Shrinking `history_capacity` drops the oldest swept statuses.
    pub fn update_config(&self, config: InstanceConfig) -> Result<(), KilnError> {
        config.validate()?;
        if config.id != self.inner.id {
            return Err(KilnError::Config(format!(
                "instance {} cannot be renamed to {}",
                self.inner.id, config.id
            )));
        }
        let history_capacity = NonZeroUsize::new(config.history_capacity)
            .ok_or_else(|| KilnError::Config("history_capacity must be positive".into()))?;

        let previous = {
            let mut st = self.inner.lock_state()?;
            if config.max_queue_size < st.queue.len() {
                return Err(KilnError::Config(format!(
                    "instance {} has {} queued tasks, cannot shrink queue to {}",
                    self.inner.id,
                    st.queue.len(),
                    config.max_queue_size
                )));
            }
            st.history.resize(history_capacity);
            let mut current = self
                .inner
                .config
                .write()
                .map_err(|e| KilnError::LockPoisoned(format!("instance config: {}", e)))?;
            let previous = current.clone();
            *current = config.clone();
            previous
        };

        self.inner.with_metrics(|m| {
            m.strategy = config.strategy;
            m.max_concurrent_tasks = config.max_concurrent_tasks;
        });
        if previous.tick_interval != config.tick_interval && self.is_running() {
            let worker = match self.worker.lock() {
                Ok(mut w) => w.take(),
                Err(p) => p.into_inner().take(),
            };
            if let Some(mut worker) = worker {
                worker.stop();
            }
            self.start()?;
        }
        info!(
            instance = %self.inner.id,
            strategy = %config.strategy,
            max_queue = config.max_queue_size,
            max_concurrent = config.max_concurrent_tasks,
            "instance configuration updated"
        );
        Ok(())
    }

    /// Install the scorer used by [`SchedulingStrategy::Custom`].
    pub fn set_scorer(&self, scorer: Arc<dyn ResourceScorer>) {
        if let Ok(mut s) = self.inner.scorer.write() {
            *s = Some(scorer);
        }
    }

    // ── Resources ─────────────────────────────────────────────

    pub fn register_resource(&self, provider: Arc<dyn ResourceProvider>) -> Result<(), KilnError> {
        let mut st = self.inner.lock_state()?;
        st.resources.register(provider).inspect_err(|e| {
            warn!(instance = %self.inner.id, error = %e, "resource registration rejected");
        })
    }

    /// Remove a resource. Tasks running on it keep running but are flagged
    /// orphaned and give nothing back to the registry when they finish.
    pub fn unregister_resource(&self, resource_id: &str) -> Result<(), KilnError> {
        let mut st = self.inner.lock_state()?;
        st.resources.unregister(resource_id)?;
        let mut orphaned = 0;
        for entry in st.tasks.values_mut() {
            if entry.holds_slot && entry.resource_id.as_deref() == Some(resource_id) {
                entry.orphaned = true;
                entry.publish();
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            warn!(
                instance = %self.inner.id,
                resource = %resource_id,
                orphaned,
                "unregistered resource still had running tasks"
            );
        }
        Ok(())
    }

    pub fn resource(&self, resource_id: &str) -> Option<ResourceInfo> {
        self.inner.lock_state().ok()?.resources.get(resource_id)
    }

    pub fn resources(&self) -> Vec<ResourceInfo> {
        self.inner
            .lock_state()
            .map(|st| st.resources.list())
            .unwrap_or_default()
    }

    /// Online resources with at least one free unit.
    pub fn available_resources(&self) -> Vec<ResourceInfo> {
        self.inner
            .lock_state()
            .map(|st| st.resources.available())
            .unwrap_or_default()
    }

    pub fn resource_count(&self) -> usize {
        self.inner
            .lock_state()
            .map(|st| st.resources.len())
            .unwrap_or(0)
    }

    pub fn set_resource_capacity(&self, resource_id: &str, capacity: usize) -> Result<(), KilnError> {
        self.inner.lock_state()?.resources.set_capacity(resource_id, capacity)
    }

    pub fn set_resource_online(&self, resource_id: &str, online: bool) -> Result<(), KilnError> {
        self.inner.lock_state()?.resources.set_online(resource_id, online)
    }

    pub fn heartbeat(&self, resource_id: &str) -> Result<(), KilnError> {
        self.inner.lock_state()?.resources.heartbeat(resource_id)
    }

    // ── Queries ───────────────────────────────────────────────

    /// Status of a live task, or the final status of a swept one.
    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.lock_state().ok()?.status_of(task_id)
    }

    /// Full snapshot of a live (not yet swept) task.
    pub fn task_snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.inner
            .lock_state()
            .ok()?
            .tasks
            .get(task_id)
            .map(|e| e.snapshot())
    }

    pub fn task_weight(&self, task_id: &str) -> Option<f64> {
        self.inner
            .lock_state()
            .ok()?
            .tasks
            .get(task_id)
            .map(|e| e.task.weight)
    }

    /// Ids of RUNNING tasks.
    pub fn active_tasks(&self) -> Vec<String> {
        let Ok(st) = self.inner.lock_state() else {
            return Vec::new();
        };
        let mut running: Vec<(u64, String)> = st
            .tasks
            .values()
            .filter(|e| e.status == TaskStatus::Running)
            .map(|e| (e.seq, e.task.id.clone()))
            .collect();
        running.sort();
        running.into_iter().map(|(_, id)| id).collect()
    }

    pub fn is_task_active(&self, task_id: &str) -> bool {
        self.task_status(task_id) == Some(TaskStatus::Running)
    }

    pub fn queue_size(&self) -> usize {
        self.inner
            .lock_state()
            .map(|st| st.queue.len())
            .unwrap_or(0)
    }

    /// Ids waiting in the queue, in arrival order.
    pub fn queued_tasks(&self) -> Vec<String> {
        let Ok(st) = self.inner.lock_state() else {
            return Vec::new();
        };
        let mut queued: Vec<(u64, String)> = st
            .queue
            .iter()
            .filter_map(|id| st.tasks.get(id).map(|e| (e.seq, id.clone())))
            .collect();
        queued.sort();
        queued.into_iter().map(|(_, id)| id).collect()
    }

    /// Slots in use over `max_concurrent_tasks`.
    pub fn utilization(&self) -> f64 {
        let max = self.inner.config().max_concurrent_tasks;
        let held = self
            .inner
            .lock_state()
            .map(|st| st.held_slots)
            .unwrap_or(0);
        if max == 0 {
            0.0
        } else {
            held as f64 / max as f64
        }
    }

    /// Anything queued, running or suspended.
    pub fn has_work(&self) -> bool {
        let Ok(st) = self.inner.lock_state() else {
            return true;
        };
        !st.queue.is_empty() || st.tasks.values().any(|e| !e.status.is_terminal())
    }

    // ── Metrics & profiling ───────────────────────────────────

    pub fn metrics(&self) -> InstanceMetrics {
        let gauges = self
            .inner
            .lock_state()
            .ok()
            .map(|st| (st.queue.len(), st.held_slots, st.resources.len()));
        let mut m = match self.inner.metrics.read() {
            Ok(m) => m.clone(),
            Err(p) => p.into_inner().clone(),
        };
        if let Some((queue, active, resources)) = gauges {
            m.set_gauges(queue, active, resources);
        }
        m
    }

    pub fn enable_profiling(&self) {
        self.inner.profiling.store(true, Ordering::Relaxed);
    }

    pub fn disable_profiling(&self) {
        self.inner.profiling.store(false, Ordering::Relaxed);
    }

    pub fn is_profiling_enabled(&self) -> bool {
        self.inner.profiling.load(Ordering::Relaxed)
    }

    /// Flat description of the instance: settings and live gauges.
    pub fn info(&self) -> BTreeMap<String, String> {
        let config = self.inner.config();
        let m = self.metrics();
        let mut info = BTreeMap::new();
        info.insert("id".to_string(), self.inner.id.clone());
        info.insert("strategy".to_string(), config.strategy.to_string());
        info.insert("max_queue_size".to_string(), config.max_queue_size.to_string());
        info.insert(
            "max_concurrent_tasks".to_string(),
            config.max_concurrent_tasks.to_string(),
        );
        info.insert(
            "default_timeout_ms".to_string(),
            config
                .default_timeout
                .map_or_else(|| "none".to_string(), |t| t.as_millis().to_string()),
        );
        info.insert(
            "tick_interval_ms".to_string(),
            config.tick_interval.as_millis().to_string(),
        );
        info.insert("queue_size".to_string(), m.queue_size.to_string());
        info.insert("active_tasks".to_string(), m.active_tasks.to_string());
        info.insert("resource_count".to_string(), m.resource_count.to_string());
        info.insert("utilization".to_string(), format!("{:.3}", m.utilization));
        info.insert("running".to_string(), self.is_running().to_string());
        info.insert("shut_down".to_string(), self.is_shut_down().to_string());
        info.insert("profiling".to_string(), self.is_profiling_enabled().to_string());
        info
    }

    /// Loop timings gathered while profiling was on, plus current gauges.
    pub fn profiling_data(&self) -> BTreeMap<String, f64> {
        let mut data = match self.inner.profile.lock() {
            Ok(p) => p.to_map(),
            Err(p) => p.into_inner().to_map(),
        };
        let m = self.metrics();
        data.insert("queue_size".to_string(), m.queue_size as f64);
        data.insert("active_tasks".to_string(), m.active_tasks as f64);
        data.insert("utilization".to_string(), m.utilization);
        data
    }
}

impl Drop for SchedulerInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}
