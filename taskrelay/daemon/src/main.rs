//! Taskrelay Daemon - Task Protocol Harness
//!
//! Wires the core to an in-process store and a scripted runner so the whole
//! task protocol can be exercised from a terminal. Frames are written to
//! stdout exactly as a streaming HTTP response would carry them.
//!
//! # Usage
//!
//! ```bash
//! # Stream one task of five chunks
//! taskrelay-daemon run --ticks 5
//!
//! # Task that fails with a credential error
//! taskrelay-daemon run --ticks 2 --fail unauthorized
//!
//! # Start an endless task and stop it, first as a stranger, then as the owner
//! taskrelay-daemon stop-demo --stop-after-ms 2500
//!
//! # With config file and verbose logging
//! RUST_LOG=debug taskrelay-daemon --config ./taskrelay.toml run
//! ```
//!
//! # Signals
//!
//! - `SIGINT` during `run`: request a stop as the task owner

mod script;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tracing::{info, warn};

use taskrelay_core::config::{default_config_path, load_config_from_path, ConfigOverrides};
use taskrelay_core::{
    GenerationService, InvokeSource, MemoryStore, Owner, StartRequest, StartedTask, WorkerOutcome,
};

use script::{ScriptFailure, ScriptedRunner};

/// Taskrelay Daemon - drive streamed generation tasks end to end
#[derive(Parser, Debug)]
#[command(name = "taskrelay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "TASKRELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "TASKRELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log validation failures with full detail
    #[arg(long)]
    debug: bool,

    /// Global concurrency cap per app (0 = unlimited)
    #[arg(long, value_name = "N")]
    max_active_requests: Option<i64>,

    /// Task budget in seconds
    #[arg(long, value_name = "SECS")]
    max_execution_time: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

/// Surface the simulated request came in through
#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceArg {
    ServiceApi,
    WebApp,
    Explore,
    Debugger,
}

impl From<SourceArg> for InvokeSource {
    fn from(source: SourceArg) -> Self {
        match source {
            SourceArg::ServiceApi => Self::ServiceApi,
            SourceArg::WebApp => Self::WebApp,
            SourceArg::Explore => Self::Explore,
            SourceArg::Debugger => Self::Debugger,
        }
    }
}

#[derive(clap::Args, Debug)]
struct TaskArgs {
    /// App the task runs for
    #[arg(long, default_value = "demo-app")]
    app: String,

    /// Principal starting the task
    #[arg(long, default_value = "demo-user")]
    user: String,

    /// Surface the request came in through
    #[arg(long, value_enum, default_value = "web-app")]
    source: SourceArg,

    /// The app's own concurrency cap (0 = none)
    #[arg(long, default_value_t = 0)]
    app_limit: i64,

    /// Milliseconds between chunks
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,
}

impl TaskArgs {
    fn owner(&self) -> Result<Owner> {
        Owner::from_source(self.source.into(), self.user.clone()).context("invalid --user")
    }

    fn request(&self) -> Result<StartRequest> {
        Ok(StartRequest::new(self.app.clone(), self.owner()?).with_app_limit(self.app_limit))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream one scripted task to stdout
    Run {
        #[command(flatten)]
        task: TaskArgs,

        /// Chunks to emit before ending
        #[arg(long, default_value_t = 5)]
        ticks: u64,

        /// End with this failure instead of completing
        #[arg(long, value_enum)]
        fail: Option<ScriptFailure>,
    },

    /// Start an endless task and stop it from another handle
    StopDemo {
        #[command(flatten)]
        task: TaskArgs,

        /// Delay before the stop requests
        #[arg(long, default_value_t = 2000)]
        stop_after_ms: u64,
    },
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "taskrelay_daemon={level},taskrelay_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn build_service(args: &Args) -> Result<GenerationService> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if args.debug {
        overrides = overrides.with_debug(true);
    }
    if let Some(max) = args.max_active_requests {
        overrides = overrides.with_max_active_requests(max);
    }
    if let Some(secs) = args.max_execution_time {
        overrides = overrides.with_max_execution_time_secs(secs);
    }
    overrides.apply(&mut config);
    config.validate()?;

    info!(source = %config.source(), "Configuration loaded");
    Ok(GenerationService::new(Arc::new(MemoryStore::new()), config))
}

/// Copy frames to stdout until the stream ends, then report the outcome
async fn forward(mut started: StartedTask) -> Result<WorkerOutcome> {
    let mut stdout = std::io::stdout();
    while let Some(frame) = started.stream.next().await {
        match frame {
            Ok(frame) => {
                stdout.write_all(frame.to_sse().as_bytes())?;
                stdout.flush()?;
            }
            Err(e) => {
                warn!(error = %e, "Dropping unserializable frame");
            }
        }
    }
    started.stream.close().await;
    started.worker.await.context("worker task failed")
}

async fn run(service: GenerationService, task: TaskArgs, ticks: u64, fail: Option<ScriptFailure>) -> Result<()> {
    let owner = task.owner()?;
    let runner = ScriptedRunner::new(Some(ticks), Duration::from_millis(task.interval_ms))
        .with_failure(fail);
    let started = service.start_task(task.request()?, Arc::new(runner)).await?;
    let task_id = started.task_id.clone();
    info!(task_id = %task_id, "Task started");

    let service = Arc::new(service);
    let stopper = {
        let service = Arc::clone(&service);
        let task_id = task_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(task_id = %task_id, "Interrupted, requesting stop");
                if let Err(e) = service.request_stop(&task_id, &owner).await {
                    warn!(error = %e, "Stop request failed");
                }
            }
        })
    };

    let outcome = forward(started).await?;
    stopper.abort();
    info!(task_id = %task_id, outcome = ?outcome, "Task finished");
    Ok(())
}

async fn stop_demo(service: GenerationService, task: TaskArgs, stop_after: Duration) -> Result<()> {
    let owner = task.owner()?;
    let stranger = Owner::from_source(task.source.into(), format!("{}-stranger", task.user))?;
    let runner = ScriptedRunner::new(None, Duration::from_millis(task.interval_ms));
    let started = service.start_task(task.request()?, Arc::new(runner)).await?;
    let task_id = started.task_id.clone();
    info!(task_id = %task_id, "Endless task started");

    let service = Arc::new(service);
    let stopper = {
        let service = Arc::clone(&service);
        let task_id = task_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(stop_after).await;
            info!(requester = %stranger, "Stop requested by a different principal");
            service.request_stop(&task_id, &stranger).await?;
            tokio::time::sleep(stop_after).await;
            info!(requester = %owner, "Stop requested by the owner");
            service.request_stop(&task_id, &owner).await?;
            Ok::<_, anyhow::Error>(())
        })
    };

    let outcome = forward(started).await?;
    stopper.await??;
    info!(task_id = %task_id, outcome = ?outcome, "Task finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let service = build_service(&args)?;
    match args.command {
        Command::Run { task, ticks, fail } => run(service, task, ticks, fail).await,
        Command::StopDemo {
            task,
            stop_after_ms,
        } => stop_demo(service, task, Duration::from_millis(stop_after_ms)).await,
    }
}
