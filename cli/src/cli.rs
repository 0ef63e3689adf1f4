use std::sync::Arc;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use taskmill_core::api::{
    AppConfig, ExecutionConfig, Priority, TaskContext, TaskEngine, TaskId,
};

use crate::observer::TaskBoard;

#[derive(Parser, Debug)]
#[command(name = "taskmill", version, about = "Resource-aware background task engine")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a batch of synthetic tasks and watch them settle.
    Run(RunArgs),
    /// Print the effective configuration as JSON.
    Config,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Number of synthetic tasks to submit.
    #[arg(long, default_value_t = 12)]
    pub tasks: usize,

    /// Nominal task duration in milliseconds; actual durations spread
    /// around this value.
    #[arg(long, default_value_t = 1500)]
    pub task_ms: u64,

    /// Fraction of the batch that fails on purpose.
    #[arg(long, default_value_t = 0.2)]
    pub fail_ratio: f64,

    /// Hard per-task timeout in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Plain log output, no progress bars.
    #[arg(long)]
    pub no_progress: bool,
}

pub async fn run(args: Args, cfg: AppConfig) -> anyhow::Result<i32> {
    match args.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(0)
        }
        Commands::Run(run_args) => run_demo(run_args, cfg).await,
    }
}

async fn run_demo(args: RunArgs, cfg: AppConfig) -> anyhow::Result<i32> {
    let board = Arc::new(TaskBoard::new(
        !args.no_progress && atty::is(atty::Stream::Stderr),
    ));
    let engine = TaskEngine::builder(cfg).observer(board.clone()).build();

    let failing = ((args.tasks as f64 * args.fail_ratio).round() as usize).min(args.tasks);
    let mut ids = Vec::with_capacity(args.tasks);
    for n in 0..args.tasks {
        let priority = match n % 3 {
            0 => Priority::High,
            1 => Priority::Medium,
            _ => Priority::Low,
        };
        // Spread durations over 0.5x..1.5x of the nominal time in ten steps.
        let total_ms = args.task_ms / 2 + (args.task_ms * (n as u64 % 5)) / 4;
        let steps = 10u64;
        let step_ms = (total_ms / steps).max(1);
        let fail = n >= args.tasks - failing;

        let mut config = ExecutionConfig::with_priority(priority);
        if let Some(ms) = args.timeout_ms {
            config = config.max_duration_ms(ms);
        }

        let id = engine.submit_fn(config, move |ctx| synthetic(ctx, steps, step_ms, fail))?;
        ids.push(id);
    }
    info!(count = ids.len(), "demo batch submitted");

    tokio::select! {
        _ = settle_all(&engine, &ids) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, draining");
        }
    }
    engine.shutdown().await;
    board.finish();

    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    Ok(0)
}

async fn settle_all(engine: &TaskEngine, ids: &[TaskId]) {
    for id in ids {
        let _ = engine.wait(id).await;
    }
}

/// Sleep in visible steps, reporting progress and honouring cancellation.
async fn synthetic(ctx: TaskContext, steps: u64, step_ms: u64, fail: bool) -> anyhow::Result<Value> {
    for step in 0..steps {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(anyhow::anyhow!("stopped at step {}/{}", step, steps));
            }
            _ = tokio::time::sleep(Duration::from_millis(step_ms)) => {}
        }
        ctx.progress().report(
            (step + 1) as f64 / steps as f64,
            format!("step {}/{}", step + 1, steps),
        );
    }

    if fail {
        anyhow::bail!("synthetic failure injected");
    }
    Ok(json!({ "steps": steps }))
}
