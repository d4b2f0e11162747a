//! kiln-worker: hosts a scheduling engine and reports its metrics.
//!
//! Creates a fixed set of scheduler instances, each with its own local
//! resources, then logs a JSON metrics snapshot on an interval until
//! Ctrl-C. Work is submitted by embedding code, not by this process.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use kiln_scheduler::{Engine, EngineConfig, InstanceConfig, ResourceSpec, SchedulingStrategy};

// ── CLI ─────────────────────────────────────────────────────────────

/// Kiln worker: resource-aware task scheduling host.
#[derive(Parser, Debug)]
#[command(name = "kiln-worker", version, about)]
struct Cli {
    /// Scheduler instances to create at startup.
    #[arg(long, env = "KILN_WORKER_INSTANCES", default_value_t = 2)]
    instances: usize,

    /// Local resources registered on each instance.
    #[arg(long, env = "KILN_WORKER_RESOURCES", default_value_t = 2)]
    resources_per_instance: usize,

    /// Concurrent tasks each local resource accepts.
    #[arg(long, env = "KILN_WORKER_RESOURCE_CAPACITY", default_value_t = 2)]
    resource_capacity: usize,

    /// Concurrency budget of each instance.
    #[arg(long, env = "KILN_WORKER_MAX_CONCURRENT", default_value_t = 4)]
    max_concurrent: usize,

    /// Metrics report interval in seconds.
    #[arg(long, env = "KILN_WORKER_METRICS_INTERVAL", default_value_t = 10)]
    metrics_interval: u64,

    /// Scheduling strategy for the instances (defaults to the engine's).
    #[arg(long, env = "KILN_WORKER_STRATEGY")]
    strategy: Option<SchedulingStrategy>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    kiln_scheduler::config::load_dotenv();
    let cli = Cli::parse();

    let config = EngineConfig::from_env();
    config.log_summary();
    let strategy = cli.strategy.unwrap_or(config.scheduling_strategy);

    let engine = Engine::new(config);
    engine.initialize()?;

    for i in 0..cli.instances {
        let id = engine.create_instance(
            InstanceConfig::new(format!("worker-{}", i))
                .strategy(strategy)
                .max_concurrent_tasks(cli.max_concurrent),
        )?;
        let instance = engine.multiplexer()?.instance(&id);
        let Some(instance) = instance else {
            warn!(instance = %id, "instance vanished before resources were attached");
            continue;
        };
        for j in 0..cli.resources_per_instance {
            instance.register_resource(Arc::new(ResourceSpec::new(
                format!("local-{}-{}", i, j),
                cli.resource_capacity,
            )))?;
        }
    }
    info!(
        instances = cli.instances,
        resources_per_instance = cli.resources_per_instance,
        strategy = %strategy,
        "kiln-worker ready"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.metrics_interval.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C, shutting down");
                break;
            }
            _ = ticker.tick() => {
                match engine.metrics() {
                    Ok(metrics) => match serde_json::to_string(&metrics) {
                        Ok(json) => info!(metrics = %json, "system metrics"),
                        Err(e) => warn!(error = %e, "failed to serialize metrics"),
                    },
                    Err(e) => warn!(error = %e, "metrics unavailable"),
                }
            }
        }
    }

    engine.shutdown();
    info!("kiln-worker stopped");
    Ok(())
}
