//! CLI entry point for the CODOR Sprint Automation Core.
//!
//! The core itself is a library-plus-controller (§6): this binary exposes
//! the editor-host command surface `{start-sprint, stop-sprint, skip-task,
//! retry-task, status}`, each mapping 1:1 onto a `SprintController`
//! operation or a direct Task Store query.

mod channel;
mod classifier;
mod commit;
mod config;
mod context;
mod controller;
mod engine;
mod errors;
mod evidence;
mod executors;
mod idle;
mod lock;
mod protocol;
mod retention;
mod store;
mod telemetry;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use channel::InProcessChannel;
use commit::CommitEmitter;
use config::CoreConfig;
use context::ContextManager;
use controller::SprintController;
use evidence::EvidenceStore;
use protocol::{Sprint, SprintStatus, TaskStatus};
use store::TaskStore;
use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "codor")]
#[command(about = "CODOR Sprint Automation Core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enables exporting traces to an OTEL collector.
    #[arg(long, global = true, default_value = "false")]
    otel: bool,

    /// Verbose logging.
    #[arg(long, short = 'v', global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Drives every pending task of a sprint to verified, skipped, or an
    /// unresolved escalation.
    StartSprint { sprint_id: String },

    /// Pauses a running sprint.
    StopSprint { sprint_id: String },

    /// Marks a task skipped and advances the sprint past it.
    SkipTask { task_id: String },

    /// Resets a failed or escalated task back to pending for another attempt.
    RetryTask { task_id: String },

    /// Prints the sprint's own status and its tasks' statuses.
    Status { sprint_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    if cli.otel && telemetry_config.otlp_endpoint.is_none() {
        telemetry_config.otlp_endpoint = Some("http://localhost:4317".to_string());
    }

    if let Err(err) = init_telemetry(telemetry_config) {
        eprintln!("failed to initialize telemetry: {err}");
    }

    let config = CoreConfig::from_env();
    let exit = run(&cli.command, &config).await;
    shutdown_telemetry();
    exit
}

async fn run(command: &Commands, config: &CoreConfig) -> ExitCode {
    let store = match TaskStore::connect(&config.database_path()).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "failed to open task store");
            return ExitCode::FAILURE;
        }
    };

    match command {
        Commands::StartSprint { sprint_id } => start_sprint(sprint_id, config, store).await,
        Commands::StopSprint { sprint_id } => {
            match store.update_sprint_status(sprint_id, SprintStatus::Paused).await {
                Ok(()) => {
                    info!(sprint_id, "sprint paused");
                    ExitCode::from(2)
                }
                Err(err) => {
                    error!(error = %err, "failed to pause sprint");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::SkipTask { task_id } => match store.transition_task_status(task_id, TaskStatus::Skipped).await {
            Ok(()) => {
                info!(task_id, "task skipped");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %err, "failed to skip task");
                ExitCode::FAILURE
            }
        },
        Commands::RetryTask { task_id } => match store.transition_task_status(task_id, TaskStatus::Pending).await {
            Ok(()) => {
                info!(task_id, "task reset to pending for retry");
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!(error = %err, "failed to reset task for retry");
                ExitCode::FAILURE
            }
        },
        Commands::Status { sprint_id } => print_status(sprint_id, &store).await,
    }
}

async fn start_sprint(sprint_id: &str, config: &CoreConfig, store: TaskStore) -> ExitCode {
    let _lock = match lock::WorkspaceLock::acquire(&config.lock_path()) {
        Ok(lock) => lock,
        Err(err) => {
            error!(error = %err, "could not acquire workspace lock");
            return ExitCode::FAILURE;
        }
    };

    let store = std::sync::Arc::new(store);
    let evidence = std::sync::Arc::new(EvidenceStore::new(config.evidence_root()));
    let (channel, _outbound_rx) = InProcessChannel::new();
    let channel = std::sync::Arc::new(channel);
    let idle = idle::IdleMonitor::new(&config.workspace_root, config.idle_threshold.as_secs());
    let commit = CommitEmitter::new(config.workspace_root.clone());

    if let Err(err) = ensure_sprint_running(&store, sprint_id).await {
        error!(error = %err, "could not start sprint");
        return ExitCode::FAILURE;
    }

    let sweep_handle = tokio::spawn(retention::run_sweep_loop(
        config.evidence_root(),
        config.evidence_retention_policy,
        config.evidence_sweep_interval,
    ));

    let controller = SprintController {
        store,
        evidence,
        channel,
        idle,
        commit,
        executors: executors::default_executors(),
        context_manager: ContextManager::default(),
        config: config.clone(),
    };

    let exit = controller.run_sprint(sprint_id).await;
    sweep_handle.abort();

    match exit {
        Ok(exit) => {
            info!(sprint_id, exit_code = exit.exit_code(), "sprint run finished");
            ExitCode::from(exit.exit_code() as u8)
        }
        Err(err) => {
            error!(error = %err, "sprint run failed");
            ExitCode::FAILURE
        }
    }
}

/// Bootstraps a fresh `Sprint` row the first time a sprint id is used,
/// rather than requiring a separate `create-sprint` command up front;
/// otherwise just flips an existing sprint back to `running`.
async fn ensure_sprint_running(store: &TaskStore, sprint_id: &str) -> Result<(), store::StoreError> {
    match store.find_sprint(sprint_id).await? {
        Some(_) => store.update_sprint_status(sprint_id, SprintStatus::Running).await,
        None => {
            store
                .create_sprint(&Sprint {
                    id: sprint_id.to_string(),
                    task_ids: vec![],
                    status: SprintStatus::Running,
                })
                .await
        }
    }
}

async fn print_status(sprint_id: &str, store: &TaskStore) -> ExitCode {
    let Some(sprint) = store.find_sprint(sprint_id).await.unwrap_or(None) else {
        eprintln!("sprint {sprint_id} not found");
        return ExitCode::FAILURE;
    };

    println!("sprint {} — {:?}", sprint.id, sprint.status);
    match store.tasks_for_sprint(sprint_id).await {
        Ok(tasks) => {
            for task in tasks {
                println!("  {} [{:?}] {}", task.id, task.status, task.title);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "failed to list tasks");
            ExitCode::FAILURE
        }
    }
}
