use std::collections::{BTreeMap, HashMap};
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;
use crate::strategy::{RoutingStrategy, SchedulingStrategy};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_opt(key)
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ── Config keys ───────────────────────────────────────────────

pub const KEY_MAX_INSTANCES: &str = "maxInstances";
pub const KEY_SCHEDULING_STRATEGY: &str = "schedulingStrategy";
pub const KEY_LOAD_BALANCING_STRATEGY: &str = "loadBalancingStrategy";
pub const KEY_AUTO_CLEANUP: &str = "autoCleanup";
pub const KEY_PROFILING_ENABLED: &str = "profilingEnabled";
pub const KEY_CLEANUP_INTERVAL_MS: &str = "cleanupIntervalMs";

/// Map a config key (camelCase or snake_case) to its canonical name.
fn canonical_key(key: &str) -> Option<&'static str> {
    match key.trim() {
        "maxInstances" | "max_instances" | "max_schedulers" => Some(KEY_MAX_INSTANCES),
        "schedulingStrategy" | "scheduling_strategy" => Some(KEY_SCHEDULING_STRATEGY),
        "loadBalancingStrategy" | "load_balancing_strategy" => Some(KEY_LOAD_BALANCING_STRATEGY),
        "autoCleanup" | "auto_cleanup" => Some(KEY_AUTO_CLEANUP),
        "profilingEnabled" | "profiling_enabled" => Some(KEY_PROFILING_ENABLED),
        "cleanupIntervalMs" | "cleanup_interval_ms" => Some(KEY_CLEANUP_INTERVAL_MS),
        _ => None,
    }
}

// ── Engine config ─────────────────────────────────────────────

/// Engine-wide settings held by the facade and forwarded to the multiplexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on live scheduler instances.
    pub max_instances: usize,
    /// Strategy given to instances created without an explicit one.
    pub scheduling_strategy: SchedulingStrategy,
    pub load_balancing_strategy: RoutingStrategy,
    /// Periodically remove idle instances.
    pub auto_cleanup: bool,
    pub profiling_enabled: bool,
    pub cleanup_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instances: 16,
            scheduling_strategy: SchedulingStrategy::Fifo,
            load_balancing_strategy: RoutingStrategy::RoundRobin,
            auto_cleanup: false,
            profiling_enabled: false,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Build config from `KILN_*` environment variables (call `load_dotenv()` first).
    /// Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_instances: env_parse("KILN_MAX_INSTANCES", d.max_instances),
            scheduling_strategy: env_parse("KILN_SCHEDULING_STRATEGY", d.scheduling_strategy),
            load_balancing_strategy: env_parse(
                "KILN_LOAD_BALANCING_STRATEGY",
                d.load_balancing_strategy,
            ),
            auto_cleanup: env_bool("KILN_AUTO_CLEANUP", d.auto_cleanup),
            profiling_enabled: env_bool("KILN_PROFILING_ENABLED", d.profiling_enabled),
            cleanup_interval: Duration::from_millis(env_parse(
                "KILN_CLEANUP_INTERVAL_MS",
                d.cleanup_interval.as_millis() as u64,
            )),
        }
    }

    /// Parse a flat key/value update on top of `self`, returning the new config.
    ///
    /// Unknown keys are ignored. Any malformed value fails the whole update;
    /// `self` is never modified.
    pub fn apply_map(&self, updates: &HashMap<String, String>) -> Result<Self, KilnError> {
        let mut next = self.clone();
        for (key, value) in updates {
            let Some(key) = canonical_key(key) else {
                tracing::debug!(key = %key, "ignoring unknown config key");
                continue;
            };
            match key {
                KEY_MAX_INSTANCES => {
                    next.max_instances = value.trim().parse().map_err(|_| {
                        KilnError::Config(format!("{} must be a non-negative integer, got {:?}", key, value))
                    })?;
                }
                KEY_SCHEDULING_STRATEGY => next.scheduling_strategy = value.parse()?,
                KEY_LOAD_BALANCING_STRATEGY => next.load_balancing_strategy = value.parse()?,
                KEY_AUTO_CLEANUP => {
                    next.auto_cleanup = parse_bool(value).ok_or_else(|| {
                        KilnError::Config(format!("{} must be a boolean, got {:?}", key, value))
                    })?;
                }
                KEY_PROFILING_ENABLED => {
                    next.profiling_enabled = parse_bool(value).ok_or_else(|| {
                        KilnError::Config(format!("{} must be a boolean, got {:?}", key, value))
                    })?;
                }
                KEY_CLEANUP_INTERVAL_MS => {
                    let ms: u64 = value.trim().parse().map_err(|_| {
                        KilnError::Config(format!("{} must be milliseconds, got {:?}", key, value))
                    })?;
                    if ms == 0 {
                        return Err(KilnError::Config(format!("{} must be positive", key)));
                    }
                    next.cleanup_interval = Duration::from_millis(ms);
                }
                _ => {}
            }
        }
        Ok(next)
    }

    /// Flat key/value view, as reported by the facade.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(KEY_MAX_INSTANCES.to_string(), self.max_instances.to_string());
        map.insert(
            KEY_SCHEDULING_STRATEGY.to_string(),
            self.scheduling_strategy.to_string(),
        );
        map.insert(
            KEY_LOAD_BALANCING_STRATEGY.to_string(),
            self.load_balancing_strategy.to_string(),
        );
        map.insert(KEY_AUTO_CLEANUP.to_string(), self.auto_cleanup.to_string());
        map.insert(
            KEY_PROFILING_ENABLED.to_string(),
            self.profiling_enabled.to_string(),
        );
        map.insert(
            KEY_CLEANUP_INTERVAL_MS.to_string(),
            self.cleanup_interval.as_millis().to_string(),
        );
        map
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Engine config loaded:");
        tracing::info!("  instances:   max={}", self.max_instances);
        tracing::info!(
            "  strategy:    scheduling={}, routing={}",
            self.scheduling_strategy,
            self.load_balancing_strategy
        );
        tracing::info!(
            "  cleanup:     auto={}, interval={:?}",
            self.auto_cleanup,
            self.cleanup_interval
        );
        tracing::info!("  profiling:   {}", self.profiling_enabled);
    }
}
