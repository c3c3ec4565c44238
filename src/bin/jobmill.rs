//! Command-line runner for a jobmill engine.
//!
//! Usage:
//!   jobmill init-config jobmill.toml
//!   jobmill run --config jobmill.toml --cron "*/10 * * * * *" --enqueue 5

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use jobmill::{
    EngineConfig, JobContext, JobDefinition, JobError, JobHandler, JobManager, LoggingConfig,
    Typed, TypedJobHandler,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobmill")]
#[command(about = "Run and manage an in-process jobmill engine")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start an engine with the built-in echo and sleep handlers")]
    Run {
        #[arg(short, long, help = "TOML configuration file", value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(long, help = "Override the configured concurrency")]
        concurrency: Option<usize>,

        #[arg(long, help = "Schedule an echo job with this six-field cron expression")]
        cron: Option<String>,

        #[arg(long, help = "Timezone for --cron", default_value = "UTC")]
        timezone: String,

        #[arg(long, help = "Enqueue this many sleep jobs at startup", default_value_t = 0)]
        enqueue: usize,

        #[arg(
            long = "report-interval",
            help = "Seconds between health reports",
            default_value_t = 30
        )]
        report_interval: u64,
    },

    #[command(about = "Write a default configuration file")]
    InitConfig {
        #[arg(help = "Destination path", value_name = "FILE")]
        path: PathBuf,

        #[arg(long, help = "Use the production preset")]
        production: bool,
    },
}

/// Returns its payload unchanged.
struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(
        &self,
        payload: &serde_json::Value,
        _ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, JobError> {
        info!("echo: {}", payload);
        Ok(json!({ "echo": payload }))
    }
}

#[derive(Debug, Deserialize)]
struct SleepPayload {
    millis: u64,
}

#[derive(Debug, Serialize)]
struct SleepOutput {
    slept_ms: u64,
}

/// Sleeps for the requested time, stopping early if the attempt times out.
struct SleepHandler;

#[async_trait]
impl TypedJobHandler for SleepHandler {
    type Payload = SleepPayload;
    type Output = SleepOutput;

    fn name(&self) -> &str {
        "sleep"
    }

    fn validate(&self, payload: &SleepPayload) -> std::result::Result<(), String> {
        if payload.millis > 600_000 {
            return Err("sleep is limited to 10 minutes".to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        payload: SleepPayload,
        ctx: JobContext,
    ) -> std::result::Result<SleepOutput, JobError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(payload.millis)) => {
                Ok(SleepOutput { slept_ms: payload.millis })
            }
            _ = ctx.cancelled() => Err(JobError::Cancelled),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            concurrency,
            cron,
            timezone,
            enqueue,
            report_interval,
        } => {
            let mut config = match config {
                Some(path) => EngineConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => EngineConfig::from_env().context("reading JOBMILL_* environment")?,
            };
            if let Some(concurrency) = concurrency {
                config = config.with_concurrency(concurrency);
            }
            setup_logging(&config.logging)?;
            run(config, cron, &timezone, enqueue, report_interval).await
        }
        Commands::InitConfig { path, production } => {
            let config = if production {
                EngineConfig::production()
            } else {
                EngineConfig::default()
            };
            config
                .save_to_file(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote configuration to {}", path.display());
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}

fn setup_logging(logging: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(
    config: EngineConfig,
    cron: Option<String>,
    timezone: &str,
    enqueue: usize,
    report_interval: u64,
) -> Result<()> {
    let manager = JobManager::new(config)?;
    manager.register_handler(EchoHandler)?;
    manager.register_handler(Typed(SleepHandler))?;

    manager.start().await?;

    if let Some(expression) = cron {
        let schedule_id = manager.schedule_job(
            JobDefinition::new("echo", json!({ "source": "cron" })),
            &expression,
            Some(timezone),
        )?;
        let upcoming = manager.scheduler().next_runs(&schedule_id, 3)?;
        info!("Scheduled echo job {} next at {:?}", schedule_id, upcoming);
    }

    for i in 0..enqueue {
        let millis = 100 * (i as u64 + 1);
        manager.add_job(
            JobDefinition::new("sleep", json!({ "millis": millis })).with_priority((i % 3) as i32),
        )?;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(report_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = ticker.tick() => report(&manager)?,
        }
    }

    info!("Shutting down");
    manager.stop().await?;
    report(&manager)?;
    Ok(())
}

fn report(manager: &JobManager) -> Result<()> {
    let health = manager.health_check();
    let metrics = manager.get_metrics();
    let queue = manager.get_queue_status()?;

    info!(
        healthy = health.healthy,
        pending = queue.pending,
        processing = queue.processing,
        completed = metrics.completed_jobs,
        failed = metrics.failed_jobs,
        success_rate = metrics.success_rate,
        "Engine status"
    );
    for issue in &health.issues {
        warn!("Health issue: {}", issue);
    }
    Ok(())
}
