//! hostwatch-scheduler: runs a batch of host probes through the scheduler
//! and prints the resulting status report as JSON.
//!
//! The batch exercises the main scheduling paths:
//! - a dependency chain (sample -> aggregate -> report)
//! - probes across all four priorities
//! - a hung probe that trips its timeout
//! - a flaky probe that succeeds after retries

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use hostwatch_core::config::{load_dotenv, CoreConfig};
use hostwatch_core::telemetry;
use hostwatch_scheduler::{
    chain_tasks, wait_for_task, JobError, Payload, Priority, Scheduler, SchedulerConfig, Task,
    TaskContext,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Run a demo batch of host probes through the task scheduler.
#[derive(Parser, Debug)]
#[command(name = "hostwatch-scheduler", version, about)]
struct Cli {
    /// Path to a scheduler TOML config file.
    #[arg(long, env = "HOSTWATCH_SCHEDULER_CONFIG")]
    config: Option<PathBuf>,

    /// Worker pool size (overrides the config file).
    #[arg(long)]
    workers: Option<usize>,

    /// Timeout applied to the hung probe, in seconds.
    #[arg(long, default_value_t = 1)]
    probe_timeout: u64,

    /// How long to wait for the batch before giving up, in seconds.
    #[arg(long, default_value_t = 30)]
    wait: u64,
}

// ── Probes ──────────────────────────────────────────────────────────

/// Simulated probe that reports progress over `steps` ticks.
fn sample_probe(
    metric: &'static str,
    steps: u32,
) -> impl Fn(&TaskContext) -> Result<Payload, JobError> + Send + Sync + 'static {
    move |ctx| {
        for step in 1..=steps {
            ctx.wait_if_paused();
            ctx.sleep(Duration::from_millis(50))?;
            ctx.update_progress(step as f64 * 100.0 / steps as f64, Some(metric));
        }
        let mut out = Payload::new();
        out.insert("metric".into(), metric.into());
        out.insert("samples".into(), steps.into());
        Ok(out)
    }
}

fn probe(name: &str, priority: Priority, metric: &'static str, steps: u32) -> Task {
    Task::builder(name)
        .description(format!("sample {metric}"))
        .priority(priority)
        .build_fn(sample_probe(metric, steps))
}

fn main() -> anyhow::Result<()> {
    load_dotenv();
    let core = CoreConfig::from_env();
    telemetry::init(&core.log_filter)?;

    let cli = Cli::parse();
    core.log_summary();

    let config_path = cli.config.or_else(|| core.scheduler_config.clone());
    let mut config = match &config_path {
        Some(path) => SchedulerConfig::from_file(path, &core.profile)
            .with_context(|| format!("failed to load scheduler config {}", path.display()))?,
        None => SchedulerConfig::from_env(&core.profile)?,
    };
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    config.validate()?;

    let scheduler = Scheduler::new(config);
    scheduler.start()?;

    // Dependency chain.
    let chain = chain_tasks(
        &scheduler,
        vec![
            probe("cpu-sample", Priority::High, "cpu", 4),
            probe("cpu-aggregate", Priority::Normal, "cpu_avg", 2),
            probe("cpu-report", Priority::Low, "cpu_report", 1),
        ],
    )?;

    // Priority mix.
    let mut batch = chain.clone();
    for (name, priority, metric) in [
        ("disk-scan", Priority::Low, "disk"),
        ("mem-sample", Priority::Normal, "memory"),
        ("net-sample", Priority::High, "network"),
        ("sensor-sample", Priority::Critical, "temperature"),
    ] {
        batch.push(scheduler.add_task(probe(name, priority, metric, 3))?);
    }

    // Hung probe.
    let hung = Task::builder("hung-probe")
        .description("never returns on its own")
        .timeout(Duration::from_secs(cli.probe_timeout))
        .build_fn(|ctx| loop {
            ctx.sleep(Duration::from_millis(100))?;
        });
    batch.push(scheduler.add_task(hung)?);

    // Flaky probe: fails twice, then succeeds.
    let attempts = Arc::new(AtomicU32::new(0));
    let flaky = Task::builder("flaky-probe")
        .retries(2)
        .retry_backoff(Duration::from_millis(100))
        .on_complete(|result| info!(task = %result.name, status = %result.status, "flaky probe done"))
        .build_fn(move |_| {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                return Err(JobError::failed("transient read error"));
            }
            Ok(Payload::new())
        });
    batch.push(scheduler.add_task(flaky)?);

    let wait = Some(Duration::from_secs(cli.wait));
    for id in &batch {
        match wait_for_task(&scheduler, id, wait) {
            Some(result) => info!(
                task = %result.name,
                status = %result.status,
                elapsed = ?result.execution_time,
                "probe finished"
            ),
            None => warn!(task_id = %id, "probe did not finish in time"),
        }
    }

    scheduler.stop(true);
    let report = serde_json::to_string_pretty(&scheduler.get_status().to_json())?;
    println!("{report}");
    Ok(())
}
