use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use darkroom::config::Config;
use darkroom::context::AppContext;
use darkroom::db::{Database, TaskFilter};
use darkroom::index::{BruteForceIndex, SharedIndex};
use darkroom::logging;
use darkroom::providers::Providers;
use darkroom::search;
use darkroom::tasks::{Executor, HandlerRegistry, TaskKind, TaskState, WorkerPool};

enum Command {
    Run { workers: Option<usize>, once: bool },
    Ingest(PathBuf),
    TasksList(Option<TaskState>),
    TasksShow(i64),
    TasksCancel(i64),
    TasksRequeue(i64),
    Recluster,
    Search { text: String, k: usize },
    Reindex,
    Metrics,
}

struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut rest = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("darkroom {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    exit_usage("--config requires a path argument");
                }
            }
            _ => rest.push(args[i].clone()),
        }
        i += 1;
    }

    match parse_command(&rest) {
        Ok(command) => Cli {
            config_path,
            command,
        },
        Err(e) => exit_usage(&e.to_string()),
    }
}

fn parse_command(args: &[String]) -> Result<Command> {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = match words.as_slice() {
        ["run", flags @ ..] => {
            let mut workers = None;
            let mut once = false;
            let mut i = 0;
            while i < flags.len() {
                match flags[i] {
                    "--once" => once = true,
                    "--workers" | "-w" => {
                        let value = flags.get(i + 1).context("--workers requires a number")?;
                        workers = Some(value.parse().context("--workers requires a number")?);
                        i += 1;
                    }
                    other => bail!("Unknown run option: {}", other),
                }
                i += 1;
            }
            Command::Run { workers, once }
        }
        ["ingest", path] => Command::Ingest(PathBuf::from(path)),
        ["tasks", "list"] => Command::TasksList(None),
        ["tasks", "list", state] => Command::TasksList(Some(state.parse()?)),
        ["tasks", "show", id] => Command::TasksShow(parse_id(id)?),
        ["tasks", "cancel", id] => Command::TasksCancel(parse_id(id)?),
        ["tasks", "requeue", id] => Command::TasksRequeue(parse_id(id)?),
        ["recluster"] => Command::Recluster,
        ["search", text @ ..] if !text.is_empty() => {
            let mut k = 10;
            let mut terms = Vec::new();
            let mut i = 0;
            while i < text.len() {
                if text[i] == "-k" {
                    let value = text.get(i + 1).context("-k requires a number")?;
                    k = value.parse().context("-k requires a number")?;
                    i += 1;
                } else {
                    terms.push(text[i]);
                }
                i += 1;
            }
            if terms.is_empty() {
                bail!("search requires query text");
            }
            Command::Search {
                text: terms.join(" "),
                k,
            }
        }
        ["reindex"] => Command::Reindex,
        ["metrics"] => Command::Metrics,
        [] => bail!("Missing command"),
        other => bail!("Unknown command: {}", other.join(" ")),
    };
    Ok(command)
}

fn parse_id(value: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("Invalid task id: {}", value))
}

fn exit_usage(message: &str) -> ! {
    eprintln!("Error: {}", message);
    print_help();
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"darkroom - media library task engine

USAGE:
    darkroom [OPTIONS] <COMMAND>

COMMANDS:
    run [--workers N] [--once]   Process tasks until Ctrl-C (or until idle with --once)
    ingest PATH                  Queue a file or directory for ingest
    tasks list [STATE]           List recent tasks, optionally by state
    tasks show ID                Show one task
    tasks cancel ID              Cancel a pending task or flag a running one
    tasks requeue ID             Requeue a dead, failed or canceled task
    recluster                    Queue a full face recluster
    search TEXT [-k N]           Search images by text
    reindex                      Rebuild the vector index from stored embeddings
    metrics                      Print metrics in Prometheus text format

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    DARKROOM_CONFIG     Path to config file (overrides default location)
    DARKROOM_LOG        Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/darkroom/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    match &cli.command {
        Command::Run { .. } => {
            let _ = logging::init(Some(Config::config_dir().join("logs")));
        }
        _ => {
            let _ = logging::init_stderr();
        }
    }

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run { workers, once } => run(config, workers, once).await,
        Command::Ingest(path) => {
            let db = open_store(&config)?;
            let path = path
                .canonicalize()
                .with_context(|| format!("Cannot ingest {}", path.display()))?;
            let id = db.enqueue(
                TaskKind::Ingest,
                &json!({ "path": path.to_string_lossy() }),
                None,
            )?;
            println!("Queued ingest task {} for {}", id, path.display());
            Ok(())
        }
        Command::TasksList(state) => {
            let db = open_store(&config)?;
            let tasks = db.list_tasks(&TaskFilter {
                state,
                ..Default::default()
            })?;
            for task in tasks {
                let progress = match (task.progress_current, task.progress_total) {
                    (Some(current), Some(total)) => format!(" {}/{}", current, total),
                    _ => String::new(),
                };
                println!(
                    "{:>6}  {:<16} {:<9} retries={}{}",
                    task.id, task.kind, task.state, task.retry_count, progress
                );
            }
            let counts = db.count_by_state()?;
            println!(
                "pending={} running={} done={} failed={} dead={} canceled={}",
                counts.pending, counts.running, counts.done, counts.failed, counts.dead, counts.canceled
            );
            Ok(())
        }
        Command::TasksShow(id) => {
            let db = open_store(&config)?;
            match db.get_task(id)? {
                Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
                None => bail!("Task {} not found", id),
            }
            Ok(())
        }
        Command::TasksCancel(id) => {
            let db = open_store(&config)?;
            match db.request_cancel(id)? {
                Some(TaskState::Canceled) => println!("Task {} canceled", id),
                Some(TaskState::Running) => {
                    println!("Cancellation requested; task {} stops at its next checkpoint", id)
                }
                Some(state) => println!("Task {} is already {}", id, state),
                None => bail!("Task {} not found", id),
            }
            Ok(())
        }
        Command::TasksRequeue(id) => {
            let db = open_store(&config)?;
            if db.requeue(id)? {
                println!("Task {} requeued", id);
                Ok(())
            } else {
                bail!("Task {} is not dead, failed or canceled", id)
            }
        }
        Command::Recluster => {
            let db = open_store(&config)?;
            match db.enqueue_unique(TaskKind::PersonRecluster, &json!({}), None)? {
                Some(id) => println!("Queued recluster task {}", id),
                None => println!("A recluster is already pending"),
            }
            Ok(())
        }
        Command::Search { text, k } => {
            let ctx = AppContext::open(config)?;
            for result in search::search_by_text(&ctx, &text, k)? {
                println!(
                    "{:.4}  {}  {}",
                    result.score,
                    result.asset.path,
                    result.asset.caption.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Command::Reindex => {
            let ctx = AppContext::open(config)?;
            let loaded = search::rebuild_index(&ctx)?;
            ctx.save_index()?;
            println!("Indexed {} embeddings", loaded);
            Ok(())
        }
        Command::Metrics => {
            // Gauges only: counters live in the worker process.
            let db = Arc::new(open_store(&config)?);
            let ctx = AppContext::new(
                db,
                SharedIndex::from_config(&config.index)
                    .unwrap_or_else(|_| SharedIndex::new(Box::new(BruteForceIndex::new()))),
                Providers::placeholder(),
                config,
            );
            print!("{}", ctx.metrics.render(&ctx.db, &ctx.index)?);
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> Result<Database> {
    let db = Database::open(&config.db_path)?;
    db.initialize()?;
    Ok(db)
}

async fn run(mut config: Config, workers: Option<usize>, once: bool) -> Result<()> {
    if let Some(count) = workers {
        config.workers.count = count;
    }
    info!(db = %config.db_path.display(), "darkroom starting");

    let ctx = Arc::new(AppContext::open(config)?);
    let executor = Executor::new(ctx.clone(), Arc::new(HandlerRegistry::standard()));

    if once {
        let processed = tokio::task::spawn_blocking(move || executor.drain()).await??;
        info!(processed, "Queue drained");
        ctx.save_index()?;
        return Ok(());
    }

    let pool = WorkerPool::start(executor, &ctx.config.workers, &ctx.config.reaper)?;
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for running tasks");
    tokio::task::spawn_blocking(move || pool.shutdown()).await?;

    ctx.save_index()?;
    info!("darkroom stopped");
    Ok(())
}
