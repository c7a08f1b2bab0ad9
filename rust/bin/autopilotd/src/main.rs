//! `autopilotd` is the host daemon for the account-pool task engine.
//!
//! Usage:
//!   autopilotd -c <context-name-or-path> <command>
//!
//! The context name resolves to `/etc/autopilot/<name>.toml`.
//! If a path with `/` or `.` is given, it's used directly.
//! Every run of the daemon reclaims tasks this host left running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use autopilot_core::EngineConfig;
use autopilot_sql::{SQLStore, SqliteStore};
use task::model::{NewTask, Task, TaskListQuery, TaskLog, TaskStatus};
use task::{DirSessionProvider, ScriptRegistry, StartOutcome, TaskModule};

/// Account-pool task engine daemon.
#[derive(Parser, Debug)]
#[command(name = "autopilotd", about = "Account-pool task engine daemon")]
struct Cli {
    /// Context name or path to config file.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<String>,

    /// Data directory (overrides the config file).
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<PathBuf>,

    /// Host identity (overrides the config file and the host name).
    #[arg(long = "machine-id", global = true)]
    machine_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stop tasks this host left running after a crash.
    Reclaim,

    /// Create a task from a JSON definition.
    Create {
        /// Read the task definition from this file.
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },

    /// Run a task on this host until it settles. Ctrl-C stops it.
    Start {
        /// Task ID.
        task_id: String,
        /// Owner of the task.
        #[arg(long)]
        user: String,
        /// Only run these account items (comma separated).
        #[arg(long, value_delimiter = ',')]
        items: Vec<String>,
        /// Only re-run items whose last run failed.
        #[arg(long, conflicts_with = "items")]
        failed_only: bool,
        /// Show browser windows for this run.
        #[arg(long, conflicts_with = "headless")]
        headed: bool,
        /// Force headless browsers for this run.
        #[arg(long)]
        headless: bool,
    },

    /// Print a task and its unit logs as JSON.
    Status {
        /// Task ID.
        task_id: String,
    },

    /// List tasks as JSON, newest first.
    List {
        #[arg(long)]
        user: Option<String>,
        /// pending, running, completed, failed or stopped.
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskView {
    task: Task,
    logs: Vec<TaskLog>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Some(dir) = &config.data_dir {
        std::fs::create_dir_all(dir)?;
    }
    let sqlite_path = config.resolve_sqlite_path();
    info!("Opening database at {}", sqlite_path.display());
    let sql: Arc<dyn SQLStore> = Arc::new(
        SqliteStore::open(&sqlite_path)
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {}", e))?,
    );

    let module = TaskModule::new(
        sql,
        &config,
        ScriptRegistry::with_builtins(),
        Arc::new(DirSessionProvider),
    )?;
    let engine = module.engine();

    match cli.command {
        Commands::Reclaim => {
            // Boot already reclaimed when enabled; a second pass is a no-op.
            let report = engine.reclaim_interrupted()?;
            print_json(&report)?;
        }
        Commands::Create { file } => {
            let body = std::fs::read_to_string(&file)?;
            let req: NewTask = serde_json::from_str(&body)?;
            let task = engine.create_task(req)?;
            print_json(&task)?;
        }
        Commands::Start {
            task_id,
            user,
            items,
            failed_only,
            headed,
            headless,
        } => {
            let items = if failed_only {
                let failed = engine.failed_items(&task_id)?;
                if failed.is_empty() {
                    info!(task = %task_id, "no failed items to re-run");
                    return Ok(());
                }
                failed
            } else {
                items
            };
            let filter = (failed_only || !items.is_empty()).then_some(items.as_slice());
            let headless = match (headed, headless) {
                (true, _) => Some(false),
                (_, true) => Some(true),
                _ => None,
            };

            let outcome = engine.start_task(&task_id, &user, filter, headless).await?;
            info!(task = %task_id, ?outcome, "start requested");
            if let StartOutcome::Started { .. } = outcome {
                let settled = async {
                    loop {
                        let task = engine
                            .wait_settled(&task_id, Duration::from_secs(60))
                            .await?;
                        if task.status != TaskStatus::Running {
                            return Ok::<_, autopilot_core::ServiceError>(task);
                        }
                    }
                };
                tokio::select! {
                    settled = settled => {
                        let task = settled?;
                        info!(task = %task.id, status = %task.status, "task settled");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        warn!(task = %task_id, "interrupt received, stopping task");
                        engine.stop_task(&task_id, &user)?;
                    }
                }
            }
            print_json(&TaskView {
                task: engine.get_task(&task_id)?,
                logs: engine.task_logs(&task_id)?,
            })?;
        }
        Commands::Status { task_id } => {
            print_json(&TaskView {
                task: engine.get_task(&task_id)?,
                logs: engine.task_logs(&task_id)?,
            })?;
        }
        Commands::List {
            user,
            status,
            limit,
        } => {
            let status = match status.as_deref() {
                Some(s) => Some(
                    TaskStatus::parse(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown task status: {s}"))?,
                ),
                None => None,
            };
            let tasks = engine.list_tasks(&TaskListQuery {
                user_id: user,
                status,
                machine_id: None,
                limit,
            })?;
            print_json(&tasks)?;
        }
    }

    Ok(())
}

/// Config file, then CLI overrides.
fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(name) => {
            let path = resolve_config_path(name);
            info!("Loading configuration from {}", path.display());
            EngineConfig::load(&path)?
        }
        None => EngineConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = Some(dir.clone());
    }
    if let Some(id) = &cli.machine_id {
        config.machine_id = Some(id.clone());
    }
    Ok(config)
}

/// Resolve a context name or path to a config file path.
fn resolve_config_path(name: &str) -> PathBuf {
    if name.contains('/') || name.contains('.') {
        PathBuf::from(name)
    } else {
        PathBuf::from(format!("/etc/autopilot/{name}.toml"))
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
