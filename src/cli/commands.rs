//! CLI command definitions for rcabench-dispatch.
//!
//! Every command resolves its configuration the same way: defaults, then
//! the environment, then flags.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::collaborators::CommandHook;
use crate::config::{ConfigError, DispatcherConfig};
use crate::events::{EventStore, RedisEventStore, TraceWatcher};
use crate::handlers::{register_pipeline, Collaborators};
use crate::scheduler::{
    ConcurrencyGate, Dispatcher, HandlerRegistry, InFlightTasks, NewTask, QueueBackend,
    RedisGate, RedisQueue, Submitter, Task,
};
use crate::storage::Database;

/// Process exit code for unusable configuration.
pub const EXIT_CONFIG: i32 = 64;
/// Process exit code when Redis or the task repository cannot be reached.
pub const EXIT_UNAVAILABLE: i32 = 69;

/// Failures that map to a dedicated process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("{store} unreachable: {message}")]
    Unreachable { store: &'static str, message: String },
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => EXIT_CONFIG,
            CliError::Unreachable { .. } => EXIT_UNAVAILABLE,
        }
    }

    fn unreachable(store: &'static str, err: impl std::fmt::Display) -> Self {
        CliError::Unreachable {
            store,
            message: err.to_string(),
        }
    }
}

/// Exit code for an error returned by [`run_with_cli`].
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>()
        .map(CliError::exit_code)
        .unwrap_or(1)
}

/// Task dispatcher for the RCA benchmarking pipeline.
#[derive(Parser)]
#[command(name = "rcabench-dispatch")]
#[command(about = "Dispatch and execute RCA benchmark tasks over Redis")]
#[command(version)]
#[command(
    long_about = "rcabench-dispatch schedules benchmark tasks (image builds, fault injections, algorithm runs, result collection) on Redis queues and executes them with a bounded worker pool.\n\nExample usage:\n  rcabench-dispatch run --workers 8 --inject-fault-cmd ./hooks/inject.sh\n  rcabench-dispatch submit --json '{\"type\":\"BuildImage\",\"immediate\":true,\"payload\":{\"image\":\"rca/baro\",\"tag\":\"v2\"}}'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL (overrides REDIS_URL).
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Task repository URL (overrides DATABASE_URL).
    #[arg(long, global = true)]
    pub database_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the dispatcher and process tasks until interrupted.
    Run(RunArgs),

    /// Submit a task described as JSON.
    Submit(SubmitArgs),

    /// Cancel a task.
    Cancel(CancelArgs),

    /// Show queue depths, gate usage and task counts.
    Stats,

    /// Show a trace and its tasks.
    Trace(TraceArgs),

    /// Follow a trace's event stream until the pipeline completes.
    Watch(WatchArgs),

    /// List dead-lettered tasks.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// Apply pending task repository migrations.
    Migrate,
}

/// Arguments for `rcabench-dispatch run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker loops.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Ceiling of the global concurrency gate.
    #[arg(long)]
    pub max_concurrency: Option<u64>,

    /// Name of the detector algorithm.
    #[arg(long)]
    pub detector: Option<String>,

    /// Shell command that builds container images.
    #[arg(long, env = "BUILD_IMAGE_CMD")]
    pub build_image_cmd: Option<String>,

    /// Shell command that injects faults.
    #[arg(long, env = "INJECT_FAULT_CMD")]
    pub inject_fault_cmd: Option<String>,

    /// Shell command that runs an algorithm against a datapack.
    #[arg(long, env = "RUN_ALGORITHM_CMD")]
    pub run_algorithm_cmd: Option<String>,

    /// Shell command that collects an algorithm's results.
    #[arg(long, env = "COLLECT_RESULT_CMD")]
    pub collect_result_cmd: Option<String>,

    /// Write Prometheus metrics to this file (textfile collector format).
    #[arg(long, env = "METRICS_FILE")]
    pub metrics_file: Option<String>,

    /// Seconds between metrics file writes.
    #[arg(long, default_value = "15")]
    pub metrics_interval: u64,
}

/// Arguments for `rcabench-dispatch submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Task JSON inline.
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    pub json: Option<String>,

    /// Path to a file holding the task JSON.
    #[arg(short = 'f', long)]
    pub file: Option<String>,
}

/// Arguments for `rcabench-dispatch cancel`.
#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// Task to cancel.
    pub task_id: String,
}

/// Arguments for `rcabench-dispatch trace`.
#[derive(Parser, Debug)]
pub struct TraceArgs {
    pub trace_id: String,
}

/// Arguments for `rcabench-dispatch watch`.
#[derive(Parser, Debug)]
pub struct WatchArgs {
    pub trace_id: String,

    /// Comma-separated algorithms expected to finish (e.g. baro,rcd).
    #[arg(short = 'a', long, value_delimiter = ',')]
    pub algorithms: Vec<String>,

    /// Give up after this many seconds.
    #[arg(short = 't', long, default_value = "600")]
    pub timeout: u64,
}

/// Arguments for `rcabench-dispatch dead-letters`.
#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of entries to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse and run.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run an already-parsed CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli)?;
    match cli.command {
        Commands::Run(args) => run_dispatcher_command(config, args).await,
        Commands::Submit(args) => run_submit_command(config, args).await,
        Commands::Cancel(args) => run_cancel_command(config, args).await,
        Commands::Stats => run_stats_command(config).await,
        Commands::Trace(args) => run_trace_command(config, args).await,
        Commands::Watch(args) => run_watch_command(config, args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(config, args).await,
        Commands::Migrate => run_migrate_command(config).await,
    }
}

fn resolve_config(cli: &Cli) -> Result<DispatcherConfig, CliError> {
    let mut config = DispatcherConfig::from_env()?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(url) = &cli.database_url {
        config = config.with_database_url(url.clone());
    }
    if let Commands::Run(args) = &cli.command {
        if let Some(workers) = args.workers {
            config = config.with_num_workers(workers);
        }
        if let Some(max) = args.max_concurrency {
            config = config.with_max_concurrency(max);
        }
        if let Some(detector) = &args.detector {
            config = config.with_detector_algorithm(detector.clone());
        }
    }
    config.validate()?;
    Ok(config)
}

// ============================================================================
// Store connections
// ============================================================================

async fn open_database(config: &DispatcherConfig) -> Result<Database, CliError> {
    let db = Database::connect(&config.database_url)
        .await
        .map_err(|e| CliError::unreachable("Task repository", e))?;
    db.run_migrations()
        .await
        .map_err(|e| CliError::unreachable("Task repository", e))?;
    Ok(db)
}

async fn open_queue(config: &DispatcherConfig) -> Result<RedisQueue, CliError> {
    RedisQueue::connect(&config.redis_url)
        .await
        .map_err(|e| CliError::unreachable("Redis", e))
}

async fn open_event_store(config: &DispatcherConfig) -> Result<RedisEventStore, CliError> {
    RedisEventStore::connect(&config.redis_url, config.stream_maxlen)
        .await
        .map_err(|e| CliError::unreachable("Redis", e))
}

/// A submitter for one-shot commands; it can only signal handlers of this
/// process, so cancellation only touches the queues.
async fn open_submitter(config: &DispatcherConfig) -> Result<Submitter, CliError> {
    let db = open_database(config).await?;
    let queue = Arc::new(open_queue(config).await?);
    Ok(Submitter::new(db, queue, InFlightTasks::new()))
}

fn task_json(task: &Task) -> serde_json::Value {
    json!({
        "task_id": task.task_id,
        "type": task.task_type,
        "trace_id": task.trace_id,
        "group_id": task.group_id,
        "parent_task_id": task.parent_task_id,
        "level": task.level,
        "immediate": task.immediate,
        "execute_time": task.execute_time,
        "deadline": task.deadline,
        "state": task.state,
        "status": task.status,
        "created_at": task.created_at.to_rfc3339(),
        "updated_at": task.updated_at.to_rfc3339(),
    })
}

// ============================================================================
// Command implementations
// ============================================================================

fn pipeline_collaborators(args: &RunArgs) -> Option<Collaborators> {
    match (
        &args.build_image_cmd,
        &args.inject_fault_cmd,
        &args.run_algorithm_cmd,
        &args.collect_result_cmd,
    ) {
        (Some(build), Some(inject), Some(run), Some(collect)) => Some(Collaborators {
            builder: Arc::new(CommandHook::new(build.clone())),
            injector: Arc::new(CommandHook::new(inject.clone())),
            runner: Arc::new(CommandHook::new(run.clone())),
            collector: Arc::new(CommandHook::new(collect.clone())),
        }),
        (None, None, None, None) => None,
        _ => {
            warn!("Only some pipeline hooks are configured; pipeline handlers stay disabled");
            None
        }
    }
}

async fn run_dispatcher_command(config: DispatcherConfig, args: RunArgs) -> anyhow::Result<()> {
    crate::metrics::init_metrics()?;

    let db = open_database(&config).await?;
    let queue = open_queue(&config).await?;
    let gate: Arc<dyn ConcurrencyGate> = Arc::new(RedisGate::new(queue.connection()));
    let events: Arc<dyn EventStore> = Arc::new(open_event_store(&config).await?);

    let mut handlers = HandlerRegistry::new();
    match pipeline_collaborators(&args) {
        Some(collaborators) => register_pipeline(&mut handlers, collaborators),
        None => warn!("No pipeline hooks configured; built-in task types will be dead-lettered"),
    }

    let mut dispatcher = Dispatcher::new(
        config.clone(),
        Arc::new(queue),
        gate,
        db.clone(),
        events,
        handlers,
    );
    dispatcher.start().await?;
    info!(
        workers = config.num_workers,
        max_concurrency = config.max_concurrency,
        "Dispatcher running; press Ctrl-C to stop"
    );

    let metrics_writer = args.metrics_file.clone().map(|path| {
        let period = Duration::from_secs(args.metrics_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                write_metrics_file(&path);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    let result = dispatcher.shutdown().await;
    if let Some(writer) = metrics_writer {
        writer.abort();
    }
    if let Some(path) = &args.metrics_file {
        write_metrics_file(path);
    }
    let stats = dispatcher.stats();
    info!(
        succeeded = stats.tasks_succeeded,
        failed = stats.tasks_failed,
        dead_lettered = stats.dead_lettered,
        success_rate = format!("{:.1}%", stats.success_rate()),
        "Dispatcher stopped"
    );
    db.close().await;
    result?;
    Ok(())
}

fn write_metrics_file(path: &str) {
    // Write-then-rename so scrapers never read a partial file.
    let tmp = format!("{}.tmp", path);
    let result = fs::write(&tmp, crate::metrics::export_metrics())
        .and_then(|()| fs::rename(&tmp, path));
    if let Err(e) = result {
        warn!(path, error = %e, "Failed to write metrics file");
    }
}

async fn run_submit_command(config: DispatcherConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let body = match (args.json, args.file) {
        (Some(json), _) => json,
        (None, Some(path)) => fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path, e))?,
        (None, None) => anyhow::bail!("Either --json or --file is required"),
    };
    let new_task: NewTask = serde_json::from_str(&body)
        .map_err(|e| anyhow::anyhow!("Invalid task JSON: {}", e))?;

    let submitter = open_submitter(&config).await?;
    let task = submitter.submit(new_task).await?;
    println!("{}", serde_json::to_string_pretty(&task_json(&task))?);
    Ok(())
}

async fn run_cancel_command(config: DispatcherConfig, args: CancelArgs) -> anyhow::Result<()> {
    let submitter = open_submitter(&config).await?;
    let outcome = submitter.cancel(&args.task_id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "task_id": args.task_id,
            "removed_from": outcome.removed_from,
            "signalled": outcome.signalled,
        }))?
    );
    Ok(())
}

async fn run_stats_command(config: DispatcherConfig) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let queue = open_queue(&config).await?;
    let gate = RedisGate::new(queue.connection());

    let queues = queue.stats().await?;
    let in_flight = gate.current().await?;
    let tasks = db.task_stats().await?;

    let mut by_state: Vec<(String, u64)> = tasks
        .by_state
        .iter()
        .map(|(state, count)| (state.to_string(), *count))
        .collect();
    by_state.sort();
    let by_state: serde_json::Map<String, serde_json::Value> = by_state
        .into_iter()
        .map(|(state, count)| (state, json!(count)))
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "queues": queues,
            "in_flight": in_flight,
            "max_concurrency": config.max_concurrency,
            "tasks": {
                "total": tasks.total,
                "by_state": by_state,
            },
        }))?
    );
    Ok(())
}

async fn run_trace_command(config: DispatcherConfig, args: TraceArgs) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let Some(detail) = db.get_trace(&args.trace_id).await? else {
        anyhow::bail!("Trace {} not found", args.trace_id);
    };
    let trace = &detail.trace;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "trace_id": trace.trace_id,
            "group_id": trace.group_id,
            "first_task_type": trace.first_task_type,
            "last_event": trace.last_event.map(|e| e.as_str()),
            "state": trace.state,
            "status": trace.status,
            "start_time": trace.start_time.to_rfc3339(),
            "end_time": trace.end_time.map(|t| t.to_rfc3339()),
            "tasks": detail.tasks.iter().map(task_json).collect::<Vec<_>>(),
        }))?
    );
    Ok(())
}

async fn run_watch_command(config: DispatcherConfig, args: WatchArgs) -> anyhow::Result<()> {
    let db = open_database(&config).await?;
    let store: Arc<dyn EventStore> = Arc::new(open_event_store(&config).await?);
    let watcher = TraceWatcher::new(store, config.detector_algorithm.clone()).with_database(db);

    info!(trace_id = %args.trace_id, algorithms = ?args.algorithms, "Watching trace");
    let outcome = watcher
        .wait_for_completion(
            &args.trace_id,
            &args.algorithms,
            Duration::from_secs(args.timeout),
        )
        .await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "trace_id": args.trace_id,
            "completed": outcome.completed,
            "has_issues": outcome.has_issues,
            "finished_algorithms": outcome.finished_count,
            "events_seen": outcome.events_seen,
            "last_id": outcome.last_id.map(|id| id.to_string()),
        }))?
    );
    if !outcome.completed {
        anyhow::bail!(
            "Trace {} did not complete within {}s",
            args.trace_id,
            args.timeout
        );
    }
    Ok(())
}

async fn run_dead_letters_command(
    config: DispatcherConfig,
    args: DeadLettersArgs,
) -> anyhow::Result<()> {
    let queue = open_queue(&config).await?;
    let entries = queue.peek_dead_letters(args.limit).await?;

    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|(raw, score)| {
            let body = serde_json::from_str::<serde_json::Value>(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.clone()));
            let retry_at = if score.is_finite() {
                json!(*score as i64)
            } else {
                json!("never")
            };
            json!({ "retry_at": retry_at, "entry": body })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn run_migrate_command(config: DispatcherConfig) -> anyhow::Result<()> {
    let db = Database::connect(&config.database_url)
        .await
        .map_err(|e| CliError::unreachable("Task repository", e))?;
    let applied = db.run_migrations().await?;
    println!("Applied {} migration(s)", applied);
    db.close().await;
    Ok(())
}
