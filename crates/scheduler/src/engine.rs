//! Engine facade: one lazily built multiplexer behind a flat config map.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use kiln_core::{EngineConfig, KilnError, ResourceProvider, Task, TaskStatus};

use crate::handle::TaskHandle;
use crate::metrics::SystemMetrics;
use crate::multiplexer::Multiplexer;
use crate::ticker::PeriodicWorker;
use crate::types::InstanceConfig;

/// Explicitly constructed entry point to the scheduling engine.
///
/// Nothing runs until [`initialize`](Self::initialize). Both `initialize`
/// and `shutdown` are idempotent, and an engine can be initialized again
/// after a shutdown.
pub struct Engine {
    config: RwLock<EngineConfig>,
    multiplexer: RwLock<Option<Arc<Multiplexer>>>,
    housekeeping: Mutex<Option<PeriodicWorker>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: RwLock::new(config),
            multiplexer: RwLock::new(None),
            housekeeping: Mutex::new(None),
        }
    }

    /// Engine configured from `KILN_*` variables and `.env`.
    pub fn from_env() -> Self {
        kiln_core::config::load_dotenv();
        Self::new(EngineConfig::from_env())
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Build the multiplexer and, with `auto_cleanup`, the housekeeping
    /// loop. A second call is a successful no-op.
    pub fn initialize(&self) -> Result<(), KilnError> {
        let config = self.config();
        let mux = {
            let mut slot = self
                .multiplexer
                .write()
                .map_err(|e| KilnError::LockPoisoned(format!("engine multiplexer: {}", e)))?;
            if slot.is_some() {
                debug!("engine already initialized");
                return Ok(());
            }
            let mux = Arc::new(Multiplexer::new(&config));
            *slot = Some(Arc::clone(&mux));
            mux
        };
        self.restart_housekeeping(&config, mux)?;
        info!(
            max_instances = config.max_instances,
            routing = %config.load_balancing_strategy,
            auto_cleanup = config.auto_cleanup,
            "engine initialized"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.multiplexer
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Stop housekeeping and shut every instance down. A no-op when not
    /// initialized.
    pub fn shutdown(&self) {
        self.stop_housekeeping();
        let mux = match self.multiplexer.write() {
            Ok(mut slot) => slot.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(mux) = mux {
            mux.shutdown();
            info!("engine shut down");
        }
    }

    /// The live multiplexer, or `NotInitialized`.
    pub fn multiplexer(&self) -> Result<Arc<Multiplexer>, KilnError> {
        self.multiplexer
            .read()
            .map_err(|e| KilnError::LockPoisoned(format!("engine multiplexer: {}", e)))?
            .clone()
            .ok_or_else(|| KilnError::NotInitialized("engine".into()))
    }

    fn restart_housekeeping(&self, config: &EngineConfig, mux: Arc<Multiplexer>) -> Result<(), KilnError> {
        self.stop_housekeeping();
        if !config.auto_cleanup {
            return Ok(());
        }
        let worker = PeriodicWorker::spawn("kiln-housekeeping", config.cleanup_interval, move || {
            let removed = mux.cleanup_idle_instances();
            if !removed.is_empty() {
                debug!(removed = ?removed, "housekeeping pass");
            }
        })?;
        let mut slot = self
            .housekeeping
            .lock()
            .map_err(|e| KilnError::LockPoisoned(format!("engine housekeeping: {}", e)))?;
        *slot = Some(worker);
        Ok(())
    }

    fn stop_housekeeping(&self) {
        let worker = match self.housekeeping.lock() {
            Ok(mut slot) => slot.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(mut worker) = worker {
            worker.stop();
        }
    }

    // ── Configuration ─────────────────────────────────────────

    pub fn config(&self) -> EngineConfig {
        match self.config.read() {
            Ok(c) => c.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Flat key/value view of the current configuration.
    pub fn configuration(&self) -> BTreeMap<String, String> {
        self.config().to_map()
    }

    /// Apply a key/value update. All values are parsed before anything
    /// changes: one malformed value rejects the whole update.
    pub fn set_configuration(&self, updates: &HashMap<String, String>) -> Result<(), KilnError> {
        let next = self.config().apply_map(updates).inspect_err(|e| {
            warn!(error = %e, "configuration update rejected");
        })?;
        {
            let mut config = self
                .config
                .write()
                .map_err(|e| KilnError::LockPoisoned(format!("engine config: {}", e)))?;
            *config = next.clone();
        }
        if let Ok(mux) = self.multiplexer() {
            mux.apply_config(&next);
            self.restart_housekeeping(&next, mux)?;
        }
        info!(keys = updates.len(), "configuration updated");
        Ok(())
    }

    // ── Delegation ────────────────────────────────────────────

    pub fn submit(&self, task: Task) -> Result<TaskHandle, KilnError> {
        self.multiplexer()?.submit(task)
    }

    /// Never fails: errors, including `NotInitialized`, come back as an
    /// already FAILED handle.
    pub fn submit_async(&self, task: Task) -> TaskHandle {
        match self.multiplexer() {
            Ok(mux) => mux.submit_async(task),
            Err(e) => {
                warn!(task = %task.id, error = %e, "submission rejected");
                TaskHandle::rejected(&task, "", e)
            }
        }
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.multiplexer().is_ok_and(|mux| mux.cancel(task_id))
    }

    pub fn suspend(&self, task_id: &str) -> bool {
        self.multiplexer().is_ok_and(|mux| mux.suspend(task_id))
    }

    pub fn resume(&self, task_id: &str) -> bool {
        self.multiplexer().is_ok_and(|mux| mux.resume(task_id))
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.multiplexer().ok()?.task_status(task_id)
    }

    pub fn create_instance(&self, config: InstanceConfig) -> Result<String, KilnError> {
        self.multiplexer()?.create_instance(config)
    }

    pub fn create_default_instance(&self) -> Result<String, KilnError> {
        self.multiplexer()?.create_default_instance()
    }

    pub fn destroy_instance(&self, instance_id: &str) -> Result<(), KilnError> {
        self.multiplexer()?.destroy_instance(instance_id)
    }

    pub fn register_resource(&self, provider: Arc<dyn ResourceProvider>) -> Result<usize, KilnError> {
        self.multiplexer()?.register_resource(provider)
    }

    pub fn unregister_resource(&self, resource_id: &str) -> Result<usize, KilnError> {
        Ok(self.multiplexer()?.unregister_resource(resource_id))
    }

    pub fn cleanup_idle_instances(&self) -> Result<Vec<String>, KilnError> {
        Ok(self.multiplexer()?.cleanup_idle_instances())
    }

    // ── Metrics ───────────────────────────────────────────────

    pub fn metrics(&self) -> Result<SystemMetrics, KilnError> {
        Ok(self.multiplexer()?.system_metrics())
    }

    pub fn profiling_data(&self) -> Result<BTreeMap<String, f64>, KilnError> {
        Ok(self.multiplexer()?.profiling_data())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
