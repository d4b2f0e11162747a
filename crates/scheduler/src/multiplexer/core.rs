use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use lru::LruCache;
use tracing::{debug, info, warn};

use kiln_core::{
    validate_provider, EngineConfig, KilnError, ResourceProvider, RoutingStrategy,
    SchedulingStrategy,
};

use crate::instance::SchedulerInstance;
use crate::metrics::{InstanceMetrics, SystemMetrics, TypeStats};
use crate::types::InstanceConfig;

/// Remembered task-id → instance-id routes; older ones fall back to a scan.
const ROUTE_CACHE_SIZE: usize = 65_536;

/// Owns a bounded set of scheduler instances and routes submissions to them.
///
/// Instances are kept in creation order, which is the rotation order for
/// round-robin routing and the tie-breaker for least-loaded routing.
pub struct Multiplexer {
    pub(super) instances: RwLock<IndexMap<String, Arc<SchedulerInstance>>>,
    pub(super) routing: RwLock<RoutingStrategy>,
    pub(super) rr_cursor: AtomicUsize,
    pub(super) task_routes: Mutex<LruCache<String, String>>,
    max_instances: AtomicUsize,
    default_strategy: RwLock<SchedulingStrategy>,
    profiling: AtomicBool,
    instance_seq: AtomicU64,
    /// Providers registered through the multiplexer; new instances get them too.
    shared_resources: RwLock<Vec<Arc<dyn ResourceProvider>>>,
}

impl Multiplexer {
    pub fn new(config: &EngineConfig) -> Self {
        let route_capacity = NonZeroUsize::new(ROUTE_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            instances: RwLock::new(IndexMap::new()),
            routing: RwLock::new(config.load_balancing_strategy),
            rr_cursor: AtomicUsize::new(0),
            task_routes: Mutex::new(LruCache::new(route_capacity)),
            max_instances: AtomicUsize::new(config.max_instances),
            default_strategy: RwLock::new(config.scheduling_strategy),
            profiling: AtomicBool::new(config.profiling_enabled),
            instance_seq: AtomicU64::new(0),
            shared_resources: RwLock::new(Vec::new()),
        }
    }

    pub(super) fn read_instances(
        &self,
    ) -> Result<RwLockReadGuard<'_, IndexMap<String, Arc<SchedulerInstance>>>, KilnError> {
        self.instances
            .read()
            .map_err(|e| KilnError::LockPoisoned(format!("multiplexer instances: {}", e)))
    }

    fn write_instances(
        &self,
    ) -> Result<RwLockWriteGuard<'_, IndexMap<String, Arc<SchedulerInstance>>>, KilnError> {
        self.instances
            .write()
            .map_err(|e| KilnError::LockPoisoned(format!("multiplexer instances: {}", e)))
    }

    /// Clone out the live instances so callers never hold the map lock
    /// while talking to an instance.
    pub(super) fn live_instances(&self) -> Vec<Arc<SchedulerInstance>> {
        self.read_instances()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    // ── Instance management ───────────────────────────────────

    /// Create, register and start a new instance. Returns its id.
    ///
    /// Fails with `InstanceLimitReached` at the ceiling and with `Config`
    /// for an id already in use. Resources registered through the
    /// multiplexer are registered on the new instance as well.
    pub fn create_instance(&self, config: InstanceConfig) -> Result<String, KilnError> {
        let id = config.id.clone();
        let mut map = self.write_instances()?;
        let max = self.max_instances();
        if map.len() >= max {
            warn!(instance = %id, max, "instance limit reached");
            return Err(KilnError::InstanceLimitReached(max));
        }
        if map.contains_key(&id) {
            return Err(KilnError::Config(format!("instance id {} is already in use", id)));
        }

        let instance = Arc::new(SchedulerInstance::new(config)?);
        if self.is_profiling_enabled() {
            instance.enable_profiling();
        }
        if let Ok(shared) = self.shared_resources.read() {
            for provider in shared.iter() {
                if let Err(e) = instance.register_resource(Arc::clone(provider)) {
                    warn!(instance = %id, resource = %provider.id(), error = %e, "shared resource not registered");
                }
            }
        }
        instance.start()?;
        map.insert(id.clone(), instance);

        info!(instance = %id, total = map.len(), "instance created");
        Ok(id)
    }

    /// Create an instance named `instance-N` with default settings and the
    /// multiplexer's default strategy.
    pub fn create_default_instance(&self) -> Result<String, KilnError> {
        let strategy = self.default_strategy();
        let id = loop {
            let n = self.instance_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let candidate = format!("instance-{}", n);
            if !self.read_instances()?.contains_key(&candidate) {
                break candidate;
            }
        };
        self.create_instance(InstanceConfig::new(id).strategy(strategy))
    }

    /// Cancel the instance's live tasks, shut it down and forget it.
    pub fn destroy_instance(&self, instance_id: &str) -> Result<(), KilnError> {
        let instance = self
            .write_instances()?
            .shift_remove(instance_id)
            .ok_or_else(|| KilnError::InstanceNotFound(instance_id.to_string()))?;

        let cancelled = instance.cancel_all();
        instance.shutdown();
        self.forget_routes(instance_id);
        info!(instance = %instance_id, cancelled, "instance destroyed");
        Ok(())
    }

    fn forget_routes(&self, instance_id: &str) {
        let Ok(mut routes) = self.task_routes.lock() else {
            return;
        };
        let stale: Vec<String> = routes
            .iter()
            .filter(|(_, owner)| owner.as_str() == instance_id)
            .map(|(task, _)| task.clone())
            .collect();
        for task in stale {
            routes.pop(&task);
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<Arc<SchedulerInstance>> {
        self.read_instances().ok()?.get(instance_id).cloned()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.read_instances()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn instance_count(&self) -> usize {
        self.read_instances().map(|map| map.len()).unwrap_or(0)
    }

    pub fn instances_by_strategy(&self, strategy: SchedulingStrategy) -> Vec<String> {
        self.live_instances()
            .iter()
            .filter(|i| i.strategy() == strategy)
            .map(|i| i.id().to_string())
            .collect()
    }

    // ── Settings ──────────────────────────────────────────────

    pub fn routing_strategy(&self) -> RoutingStrategy {
        match self.routing.read() {
            Ok(r) => *r,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn set_routing_strategy(&self, routing: RoutingStrategy) {
        if let Ok(mut r) = self.routing.write() {
            *r = routing;
        }
        info!(routing = %routing, "routing strategy changed");
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances.load(Ordering::SeqCst)
    }

    /// Change the ceiling. Existing instances above it are kept; only new
    /// creations are refused.
    pub fn set_max_instances(&self, max_instances: usize) {
        self.max_instances.store(max_instances, Ordering::SeqCst);
        let current = self.instance_count();
        if current > max_instances {
            warn!(current, max_instances, "instance count above new ceiling");
        }
    }

    pub fn default_strategy(&self) -> SchedulingStrategy {
        match self.default_strategy.read() {
            Ok(s) => *s,
            Err(p) => *p.into_inner(),
        }
    }

    pub fn set_default_strategy(&self, strategy: SchedulingStrategy) {
        if let Ok(mut s) = self.default_strategy.write() {
            *s = strategy;
        }
    }

    /// Forward engine-level settings.
    pub fn apply_config(&self, config: &EngineConfig) {
        self.set_max_instances(config.max_instances);
        self.set_routing_strategy(config.load_balancing_strategy);
        self.set_default_strategy(config.scheduling_strategy);
        if config.profiling_enabled {
            self.enable_profiling();
        } else {
            self.disable_profiling();
        }
    }

    // ── Resources ─────────────────────────────────────────────

    /// Register a provider on every instance, present and future.
    /// Returns how many live instances accepted it.
    pub fn register_resource(&self, provider: Arc<dyn ResourceProvider>) -> Result<usize, KilnError> {
        validate_provider(provider.as_ref())?;
        {
            let mut shared = self
                .shared_resources
                .write()
                .map_err(|e| KilnError::LockPoisoned(format!("shared resources: {}", e)))?;
            if shared.iter().any(|p| p.id() == provider.id()) {
                return Err(KilnError::InvalidResource(format!(
                    "resource {} is already registered",
                    provider.id()
                )));
            }
            shared.push(Arc::clone(&provider));
        }

        let mut accepted = 0;
        for instance in self.live_instances() {
            match instance.register_resource(Arc::clone(&provider)) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(instance = %instance.id(), resource = %provider.id(), error = %e, "resource not registered");
                }
            }
        }
        info!(resource = %provider.id(), instances = accepted, "resource broadcast");
        Ok(accepted)
    }

    /// Remove a resource from every instance that has it. Returns how many
    /// instances dropped it.
    pub fn unregister_resource(&self, resource_id: &str) -> usize {
        if let Ok(mut shared) = self.shared_resources.write() {
            shared.retain(|p| p.id() != resource_id);
        }
        let removed = self
            .live_instances()
            .iter()
            .filter(|i| i.unregister_resource(resource_id).is_ok())
            .count();
        debug!(resource = %resource_id, instances = removed, "resource unregistered");
        removed
    }

    // ── Aggregation ───────────────────────────────────────────

    pub fn instance_metrics(&self) -> Vec<InstanceMetrics> {
        self.live_instances().iter().map(|i| i.metrics()).collect()
    }

    pub fn system_metrics(&self) -> SystemMetrics {
        SystemMetrics::aggregate(&self.instance_metrics())
    }

    /// Per-task-type statistics merged across instances.
    pub fn task_metrics(&self) -> BTreeMap<String, TypeStats> {
        let mut merged: BTreeMap<String, TypeStats> = BTreeMap::new();
        for m in self.instance_metrics() {
            for (task_type, stats) in &m.by_type {
                merged.entry(task_type.clone()).or_default().merge(stats);
            }
        }
        merged
    }

    /// Live instances per scheduling strategy.
    pub fn instance_counts(&self) -> BTreeMap<SchedulingStrategy, usize> {
        let mut counts = BTreeMap::new();
        for instance in self.live_instances() {
            *counts.entry(instance.strategy()).or_insert(0) += 1;
        }
        counts
    }

    /// RUNNING task ids, by instance.
    pub fn active_tasks_by_instance(&self) -> BTreeMap<String, Vec<String>> {
        self.live_instances()
            .iter()
            .map(|i| (i.id().to_string(), i.active_tasks()))
            .collect()
    }

    // ── Maintenance ───────────────────────────────────────────

    /// Cancel QUEUED and RUNNING tasks on every instance.
    pub fn cancel_all(&self) -> usize {
        let cancelled = self.live_instances().iter().map(|i| i.cancel_all()).sum();
        info!(cancelled, "all tasks cancelled");
        cancelled
    }

    /// Destroy instances with no registered resources and no live work.
    /// Returns the ids removed.
    pub fn cleanup_idle_instances(&self) -> Vec<String> {
        let idle: Vec<String> = self
            .live_instances()
            .iter()
            .filter(|i| i.resource_count() == 0 && !i.has_work())
            .map(|i| i.id().to_string())
            .collect();
        let mut removed = Vec::with_capacity(idle.len());
        for id in idle {
            match self.destroy_instance(&id) {
                Ok(()) => removed.push(id),
                Err(e) => debug!(instance = %id, error = %e, "idle instance already gone"),
            }
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "idle instances cleaned up");
        }
        removed
    }

    /// Check internal consistency: instance ceiling, live loops and valid
    /// per-instance configuration.
    pub fn validate(&self) -> Result<(), KilnError> {
        let instances = self.live_instances();
        let mut problems = Vec::new();
        let max = self.max_instances();
        if instances.len() > max {
            problems.push(format!("{} instances exceed ceiling {}", instances.len(), max));
        }
        for instance in &instances {
            if instance.is_shut_down() {
                problems.push(format!("instance {} is shut down", instance.id()));
            }
            if let Err(e) = instance.config().validate() {
                problems.push(format!("instance {}: {}", instance.id(), e));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            warn!(problems = problems.len(), "multiplexer validation failed");
            Err(KilnError::Config(problems.join("; ")))
        }
    }

    // ── Profiling ─────────────────────────────────────────────

    pub fn enable_profiling(&self) {
        self.profiling.store(true, Ordering::Relaxed);
        for instance in self.live_instances() {
            instance.enable_profiling();
        }
    }

    pub fn disable_profiling(&self) {
        self.profiling.store(false, Ordering::Relaxed);
        for instance in self.live_instances() {
            instance.disable_profiling();
        }
    }

    pub fn is_profiling_enabled(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    /// Per-instance profiling data keyed `<instance>.<metric>`, plus
    /// `system.*` totals.
    pub fn profiling_data(&self) -> BTreeMap<String, f64> {
        let mut data = BTreeMap::new();
        for instance in self.live_instances() {
            for (key, value) in instance.profiling_data() {
                data.insert(format!("{}.{}", instance.id(), key), value);
            }
        }
        let system = self.system_metrics();
        data.insert("system.total_instances".into(), system.total_instances as f64);
        data.insert("system.active_tasks".into(), system.active_tasks as f64);
        data.insert("system.queue_size".into(), system.queue_size as f64);
        data.insert("system.average_utilization".into(), system.average_utilization);
        data
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Shut down and forget every instance. Idempotent.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<SchedulerInstance>> = match self.instances.write() {
            Ok(mut map) => map.drain(..).map(|(_, i)| i).collect(),
            Err(p) => p.into_inner().drain(..).map(|(_, i)| i).collect(),
        };
        if drained.is_empty() {
            return;
        }
        for instance in &drained {
            instance.shutdown();
        }
        if let Ok(mut routes) = self.task_routes.lock() {
            routes.clear();
        }
        info!(instances = drained.len(), "multiplexer shut down");
    }
}
