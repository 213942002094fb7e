//! workq CLI: exercise a scheduler from the command line.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use workq::engine::WorkerExit;
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::{Error, Scheduler, SchedulerConfig, WorkOptions};

#[derive(Parser)]
#[command(name = "workq", about = "Bounded-concurrency work scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch of synthetic jobs and print a JSON summary
    Run {
        /// Number of jobs to enqueue
        #[arg(long, default_value_t = 10)]
        jobs: usize,
        /// How long each job sleeps, in milliseconds
        #[arg(long, default_value_t = 100)]
        work_ms: u64,
        /// Make every K-th job fail
        #[arg(long)]
        fail_every: Option<usize>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the effective scheduler configuration as TOML
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Settings layered over the environment.
#[derive(Args)]
struct Overrides {
    /// TOML file with a [scheduler] table, used instead of the environment
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of consumer workers
    #[arg(long)]
    consumers: Option<usize>,
    /// Per-job deadline in seconds
    #[arg(long)]
    due_time: Option<u64>,
    /// Capacity bound; -1 means unbounded
    #[arg(long, allow_negative_numbers = true)]
    max_queue_items: Option<i64>,
}

impl Overrides {
    fn resolve(self) -> anyhow::Result<SchedulerConfig> {
        let mut config = match self.config {
            Some(path) => SchedulerConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => SchedulerConfig::from_env()?,
        };
        if let Some(consumers) = self.consumers {
            config.consumer_count = consumers;
        }
        if let Some(due_time) = self.due_time {
            config.due_time_secs = due_time;
        }
        if let Some(max) = self.max_queue_items {
            config.max_queue_items = max;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Default, Serialize)]
struct RunSummary {
    jobs: usize,
    completed: usize,
    faulted: usize,
    canceled: usize,
    rejected: usize,
    elapsed_ms: u128,
    consumers: usize,
    worker_exits: Vec<WorkerExit>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            jobs,
            work_ms,
            fail_every,
            overrides,
        } => cmd_run(overrides.resolve()?, jobs, work_ms, fail_every).await,
        Command::Config { overrides } => {
            let config = overrides.resolve()?;
            print!("{}", toml::to_string(&ConfigDocument { scheduler: config })?);
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct ConfigDocument {
    scheduler: SchedulerConfig,
}

async fn cmd_run(
    config: SchedulerConfig,
    jobs: usize,
    work_ms: u64,
    fail_every: Option<usize>,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::from_env("workq"))?;

    let scheduler: Scheduler<usize> = Scheduler::with_config(config)?;
    let started = Instant::now();
    let mut summary = RunSummary {
        jobs,
        consumers: scheduler.consumer_count(),
        ..RunSummary::default()
    };

    let mut items = Vec::with_capacity(jobs);
    for job in 0..jobs {
        let fails = fail_every.is_some_and(|k| k > 0 && (job + 1) % k == 0);
        let enqueued = scheduler.enqueue_fallible(
            move || {
                std::thread::sleep(Duration::from_millis(work_ms));
                if fails {
                    anyhow::bail!("job {job} failed on purpose");
                }
                Ok(job)
            },
            WorkOptions::new(),
        );
        match enqueued {
            Ok(item) => items.push(item),
            Err(Error::CapacityExceeded { max }) => {
                tracing::debug!(job, max, "job rejected");
                summary.rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for item in items {
        match item.wait().await {
            Ok(_) => summary.completed += 1,
            Err(e) if e.is_cancellation() => summary.canceled += 1,
            Err(Error::ExecutionFault { .. }) => summary.faulted += 1,
            Err(e) => return Err(e.into()),
        }
    }
    summary.elapsed_ms = started.elapsed().as_millis();

    summary.worker_exits = tokio::task::spawn_blocking(move || scheduler.shutdown()).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
