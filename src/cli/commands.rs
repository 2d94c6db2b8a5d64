//! CLI command definitions for taskmill.
//!
//! Provides the `enqueue`, `empty`, `info` and `worker` commands over a
//! shared Redis deployment. Connection failures exit non-zero; a clean
//! interrupt of the monitor exits zero.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::config::Settings;
use crate::maintenance::registry_maintenance;
use crate::queue::Queue;
use crate::registry::{QueueRegistry, WorkerRegistry};
use crate::store::Store;
use crate::task::Task;
use crate::worker::Worker;

use super::handlers::handler_for;

/// Width of the widest bar drawn by `info`.
const BAR_WIDTH: usize = 40;

/// Redis-backed distributed task queue.
#[derive(Parser)]
#[command(name = "taskmill")]
#[command(about = "Distributed task queue broker backed by Redis")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// URL describing the Redis connection.
    #[arg(
        short,
        long,
        env = "TASKMILL_REDIS_URL",
        default_value = "redis://localhost:6379",
        global = true
    )]
    pub url: String,

    /// Prefix under which all keys are stored.
    #[arg(
        long,
        env = "TASKMILL_KEY_PREFIX",
        default_value = "taskmill",
        global = true
    )]
    pub prefix: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Enqueue a task onto a queue.
    Enqueue(EnqueueArgs),

    /// Empty given queues, deleting their pending tasks.
    Empty(EmptyArgs),

    /// Show queues, workers and running tasks.
    Info(InfoArgs),

    /// Start a worker bound to the given queues.
    Worker(WorkerArgs),
}

/// Arguments for `taskmill enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Queue to enqueue onto.
    pub queue: String,

    /// Task payload as a JSON document.
    #[arg(default_value = "{}")]
    pub payload: String,

    /// Use a caller-supplied task id instead of a generated one.
    #[arg(long)]
    pub id: Option<String>,
}

/// Arguments for `taskmill empty`.
#[derive(Parser, Debug)]
pub struct EmptyArgs {
    /// Empty all registered queues.
    #[arg(short, long)]
    pub all: bool,

    /// Queues to empty.
    pub queues: Vec<String>,
}

/// Arguments for `taskmill info`.
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Show only queue info.
    #[arg(short = 'Q', long, conflicts_with = "only_workers")]
    pub only_queues: bool,

    /// Show only worker info.
    #[arg(short = 'W', long)]
    pub only_workers: bool,

    /// Group running tasks by queue.
    #[arg(short = 'R', long)]
    pub by_queue: bool,

    /// Refresh every N seconds instead of printing once.
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Print only raw numbers, no bar charts.
    #[arg(short, long)]
    pub raw: bool,

    /// Limit output to these queues.
    pub queues: Vec<String>,
}

/// Arguments for `taskmill worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Quit once all assigned queues are drained.
    #[arg(short, long)]
    pub burst: bool,

    /// Worker name (defaults to a generated unique id).
    #[arg(short, long)]
    pub name: Option<String>,

    /// Heartbeat timeout in seconds after which this deployment considers
    /// a worker dead.
    #[arg(long)]
    pub worker_ttl: Option<u64>,

    /// Task handler to execute payloads with.
    #[arg(long, default_value = "shell")]
    pub handler: String,

    /// Queues to claim from, first listed drains first.
    #[arg(default_values_t = vec!["default".to_string()])]
    pub queues: Vec<String>,
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::new(&cli.url).with_key_prefix(&cli.prefix);
    let store = Store::connect(&settings.redis_url, &settings.key_prefix)
        .await
        .context("could not connect to Redis")?;

    match cli.command {
        Commands::Enqueue(args) => cmd_enqueue(&store, args).await,
        Commands::Empty(args) => cmd_empty(&store, args).await,
        Commands::Info(args) => cmd_info(&store, args).await,
        Commands::Worker(args) => cmd_worker(store, settings, args).await,
    }
}

async fn cmd_enqueue(store: &Store, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload is not valid JSON")?;

    let mut task = match args.id {
        Some(id) => Task::with_id(id, payload),
        None => Task::new(payload),
    };
    Queue::new(&args.queue).enqueue(store, &mut task).await?;
    println!("{}", task.id);
    Ok(())
}

async fn cmd_empty(store: &Store, args: EmptyArgs) -> anyhow::Result<()> {
    let names = if args.all {
        QueueRegistry::new(store.keys()).names(store).await?
    } else {
        args.queues
    };

    if names.is_empty() {
        println!("Nothing to do");
        return Ok(());
    }

    for name in names {
        let removed = Queue::new(&name).empty(store).await?;
        println!("{} tasks removed from {} queue", removed, name);
    }
    Ok(())
}

async fn cmd_info(store: &Store, args: InfoArgs) -> anyhow::Result<()> {
    loop {
        render_info(store, &args).await?;

        let Some(interval) = args.interval else {
            return Ok(());
        };
        // Clean interrupt of the monitor is a success exit.
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(interval.max(1))) => {}
        }
    }
}

async fn render_info(store: &Store, args: &InfoArgs) -> anyhow::Result<()> {
    let names = if args.queues.is_empty() {
        QueueRegistry::new(store.keys()).names(store).await?
    } else {
        let mut names = args.queues.clone();
        names.sort();
        names
    };

    if !args.only_workers {
        let mut total = 0;
        for name in &names {
            let pending = Queue::new(name).len(store).await?;
            total += pending;
            if args.raw {
                println!("queue {} {}", name, pending);
            } else {
                println!("{:<16} |{} {}", name, bar(pending), pending);
            }
        }
        println!("{} queues, {} tasks total\n", names.len(), total);
    }

    if !args.only_queues {
        render_workers(store, args, &names).await?;
    }

    if !args.raw {
        println!("Updated: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

async fn render_workers(store: &Store, args: &InfoArgs, names: &[String]) -> anyhow::Result<()> {
    let registry = WorkerRegistry::new(store.keys());
    let entries = registry.entries(store).await?;
    let now = store.server_time().await?;

    if args.by_queue {
        // Group busy workers by the queue their running task came from.
        for name in names {
            let mut busy = Vec::new();
            for (worker_id, _) in &entries {
                if let Some(task_id) = registry.running_task_of(store, worker_id).await? {
                    if let Ok(task) = Task::fetch(store, &task_id).await {
                        if task.queue.as_deref() == Some(name.as_str()) {
                            busy.push(worker_id.clone());
                        }
                    }
                }
            }
            let listing = if busy.is_empty() {
                "-".to_string()
            } else {
                busy.join(", ")
            };
            println!("{}: {}", name, listing);
        }
    } else {
        for (worker_id, last_heartbeat) in &entries {
            let age = now - last_heartbeat;
            let state = match registry.running_task_of(store, worker_id).await? {
                Some(task_id) => format!("busy ({})", task_id),
                None => "idle".to_string(),
            };
            println!("{} {} (heartbeat {:.1}s ago)", worker_id, state, age);
        }
    }
    println!("{} workers\n", entries.len());
    Ok(())
}

fn bar(count: usize) -> String {
    "█".repeat(count.min(BAR_WIDTH))
}

async fn cmd_worker(store: Store, settings: Settings, args: WorkerArgs) -> anyhow::Result<()> {
    let mut settings = settings;
    if let Some(ttl) = args.worker_ttl {
        settings = settings.with_heartbeat_timeout(Duration::from_secs(ttl));
    }

    let Some(handler) = handler_for(&args.handler) else {
        bail!("unknown handler '{}' (expected 'shell' or 'noop')", args.handler);
    };

    // Reclaim leftovers from earlier runs before taking on new work.
    registry_maintenance(&store, &settings).await;

    let mut worker = Worker::new(store, args.queues, handler, settings);
    if let Some(name) = args.name {
        worker = worker.with_name(name);
    }

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(());
        }
    });

    worker.run(args.burst).await?;
    Ok(())
}
