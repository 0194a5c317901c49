//! PatchDaemon - task graph execution engine
//!
//! CLI entry point for submitting runs, supervising them and reviewing patches.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{error, info};

use patchdaemon::cli::{Cli, Command, DaemonCommand, LedgerCommand, OutputFormat, get_log_path};
use patchdaemon::config::Config;
use patchdaemon::daemon::{DaemonManager, DaemonOrchestrator, OsProcessSpawner};
use patchdaemon::domain::{Lifecycle, PatchLedgerEntry, PatchState, RunRecord, RunState, TaskGraphDocument};
use patchdaemon::events::{create_event_bus, spawn_event_recorder};
use patchdaemon::ledger::PatchLedger;
use patchdaemon::orchestrator::{RunOrchestrator, RunSummary};
use patchdaemon::scheduler::TaskGraph;
use patchdaemon::state::StateManager;
use patchdaemon::worktree::WorktreeManager;

fn setup_logging(level: &str) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Daemon and run processes share one file, so append
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;
    let level: tracing::Level = level.parse().unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!(%level, pid = std::process::id(), "Logging initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // CLI beats config beats INFO
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    match cli.command {
        Some(Command::Daemon { command }) => match command {
            DaemonCommand::Start { foreground } => cmd_start(&config, cli.config.as_deref(), foreground).await,
            DaemonCommand::Stop => cmd_stop(),
            DaemonCommand::Status { format } => cmd_status(format),
        },
        Some(Command::RunDaemon) => cmd_run_daemon(&config, cli.config.as_deref()).await,
        Some(Command::Submit { graph, project, phase }) => cmd_submit(&config, &graph, &project, &phase).await,
        Some(Command::Run { run_id, graph }) => cmd_run(&config, &run_id, graph).await,
        Some(Command::Runs { state, format }) => cmd_runs(&config, state.as_deref(), format).await,
        Some(Command::Ledger { command }) => cmd_ledger(&config, command).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Spawn the StateManager over the configured store directory
fn open_state(config: &Config) -> Result<StateManager> {
    let store_dir = &config.storage.store_dir;
    fs::create_dir_all(store_dir).context(format!("Failed to create store directory {}", store_dir.display()))?;
    StateManager::spawn(store_dir).context("Failed to spawn StateManager")
}

/// Start the daemon
async fn cmd_start(config: &Config, config_path: Option<&Path>, foreground: bool) -> Result<()> {
    let daemon = DaemonManager::new();

    if let Some(pid) = daemon.running_pid() {
        println!("PatchDaemon is already running (PID: {})", pid);
        return Ok(());
    }

    if foreground {
        println!("Starting PatchDaemon in foreground mode...");
        cmd_run_daemon(config, config_path).await
    } else {
        let pid = daemon.start(config_path)?;
        println!("{} (PID: {})", "PatchDaemon started".green(), pid);
        Ok(())
    }
}

/// Stop the daemon
fn cmd_stop() -> Result<()> {
    let daemon = DaemonManager::new();

    let Some(pid) = daemon.running_pid() else {
        println!("PatchDaemon is not running");
        return Ok(());
    };

    daemon.stop()?;
    println!("PatchDaemon stopped (was PID: {})", pid);
    Ok(())
}

/// Show daemon status
fn cmd_status(format: OutputFormat) -> Result<()> {
    let status = DaemonManager::new().status();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "running": status.running,
                "pid": status.pid,
                "pid_file": status.pid_file.to_string_lossy()
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("PatchDaemon Status");
            println!("------------------");
            match status.pid {
                Some(pid) if status.running => {
                    println!("Status: {}", "running".green());
                    println!("PID: {}", pid);
                }
                _ => println!("Status: {}", "stopped".yellow()),
            }
            println!("PID file: {}", status.pid_file.display());
        }
    }

    Ok(())
}

/// Run as the daemon process (internal command)
async fn cmd_run_daemon(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let daemon = DaemonManager::new();
    daemon.register_self()?;

    let result = run_daemon(config, config_path).await;
    if let Err(e) = daemon.unregister_self() {
        error!(error = %e, "Failed to remove PID file");
    }
    result
}

async fn run_daemon(config: &Config, config_path: Option<&Path>) -> Result<()> {
    info!("Daemon starting...");
    fs::create_dir_all(&config.daemon.log_dir)
        .context(format!("Cannot create run log directory {}", config.daemon.log_dir.display()))?;

    let state = open_state(config)?;

    // Run processes read the same config the daemon was started with
    let mut run_command = config.daemon.run_command.clone();
    if let Some(path) = config_path {
        run_command.push("--config".to_string());
        run_command.push(path.to_string_lossy().to_string());
    }

    let worktrees = Arc::new(WorktreeManager::new(config.worktree.to_worktree_config()));
    let mut orchestrator =
        DaemonOrchestrator::new(config.daemon.clone(), state.clone(), Box::new(OsProcessSpawner::new(run_command)))
            .with_worktrees(worktrees);

    orchestrator.start().await?;
    state.shutdown().await?;
    info!("Daemon stopped");
    Ok(())
}

/// Queue a graph as a new PENDING run
async fn cmd_submit(config: &Config, graph: &Path, project: &str, phase: &str) -> Result<()> {
    // Reject unreadable graphs now rather than in the run process
    let doc = TaskGraphDocument::load(graph)?;
    TaskGraph::from_document(doc)?.validate()?;

    let graph = fs::canonicalize(graph).context(format!("Failed to resolve {}", graph.display()))?;
    let state = open_state(config)?;
    let run = RunRecord::new(project, phase).with_meta("graph_path", graph.to_string_lossy().to_string());
    let run_id = state.create_run(run).await?;
    println!("Submitted run {}", run_id.bold());
    Ok(())
}

/// Execute one run in the foreground; exits non-zero unless every task completed
async fn cmd_run(config: &Config, run_id: &str, graph: Option<PathBuf>) -> Result<()> {
    let state = open_state(config)?;

    let run = match state.get_run(run_id).await? {
        Some(run) => run,
        None => {
            let mut run = RunRecord::with_id(run_id, "default", "manual");
            if let Some(path) = &graph {
                run.set_meta("graph_path", path.to_string_lossy().to_string());
            }
            state.create_run(run.clone()).await?;
            run
        }
    };

    let graph_path = graph
        .or_else(|| run.graph_path().map(PathBuf::from))
        .ok_or_else(|| eyre::eyre!("Run {} has no task graph; pass --graph", run_id))?;

    let bus = create_event_bus();
    let recorder = spawn_event_recorder(&bus, state.clone());
    let emitter = bus.emitter_for(run_id);

    let prepared = TaskGraphDocument::load(&graph_path)
        .and_then(|doc| Ok(TaskGraph::from_document(doc)?))
        .and_then(|graph| Ok((graph, RunOrchestrator::from_config(config, state.clone(), run_id, emitter)?)));
    let (graph, mut orchestrator) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            fail_run(&state, run_id, &format!("{:#}", e)).await;
            recorder.finish().await;
            return Err(e);
        }
    };

    let summary = orchestrator.run(run_id, graph).await;
    let written = recorder.finish().await;
    info!(%run_id, events = written, "Event recorder finished");

    let summary = summary?;
    print_summary(&summary);
    state.shutdown().await?;
    if !summary.succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Persist a setup failure as the run's first fatal error
async fn fail_run(state: &StateManager, run_id: &str, error: &str) {
    let Ok(Some(run)) = state.get_run(run_id).await else {
        return;
    };
    if run.state.is_terminal() {
        return;
    }
    let metadata = vec![("error".to_string(), serde_json::json!(error))];
    if let Err(e) = state.transition_run(run_id, RunState::Failed, metadata).await {
        error!(%run_id, error = %e, "Failed to mark run as failed");
    }
}

fn print_summary(summary: &RunSummary) {
    let status = if summary.succeeded {
        "SUCCEEDED".green()
    } else {
        "FAILED".red()
    };
    println!("Run {}: {}", summary.run_id.bold(), status);
    println!("  Completed:  {}", summary.completed);
    println!("  Failed:     {}", summary.failed);
    println!("  Skipped:    {}", summary.skipped);
    println!("  Unroutable: {}", summary.unroutable);
    println!("  Blocked:    {}", summary.blocked);
    if let Some(path) = &summary.worktree {
        println!("  Worktree:   {}", path.display());
    }
    for patch in &summary.patches {
        println!("  Patch:      {}", patch);
    }
    if let Some(error) = &summary.fatal_error {
        println!("  Error:      {}", error.red());
    }
}

/// List runs
async fn cmd_runs(config: &Config, state_filter: Option<&str>, format: OutputFormat) -> Result<()> {
    let state_filter = state_filter.map(str::parse::<RunState>).transpose().map_err(|e| eyre::eyre!(e))?;
    let state = open_state(config)?;
    let runs = state.list_runs(state_filter).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&runs)?),
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("No runs found.");
            }
            for run in &runs {
                let run_state = match run.state {
                    RunState::Succeeded => run.state.to_string().green(),
                    RunState::Failed => run.state.to_string().red(),
                    _ => run.state.to_string().yellow(),
                };
                println!("{}  {}  {}/{}", run.run_id.bold(), run_state, run.project_id, run.phase_id);
                if let Some(error) = run.meta_str("error") {
                    println!("    error: {}", error);
                }
            }
        }
    }
    Ok(())
}

async fn cmd_ledger(config: &Config, command: LedgerCommand) -> Result<()> {
    let state = open_state(config)?;
    let ledger = PatchLedger::new(state);

    match command {
        LedgerCommand::List {
            state,
            run,
            workstream,
            format,
        } => {
            let state = state.as_deref().map(str::parse::<PatchState>).transpose().map_err(|e| eyre::eyre!(e))?;
            let entries = ledger.list(state, run.as_deref(), workstream.as_deref()).await?;
            print_entries(&entries, format)
        }
        LedgerCommand::Review { run } => {
            let entries = ledger.list_awaiting_review(run.as_deref(), None).await?;
            print_entries(&entries, OutputFormat::Text)
        }
        LedgerCommand::Approve {
            ledger_id,
            reviewer,
            comment,
        } => report(
            ledger.approve_patch(&ledger_id, &reviewer, comment.as_deref()).await?,
            &ledger_id,
            "approved",
        ),
        LedgerCommand::Reject {
            ledger_id,
            reviewer,
            reason,
        } => report(ledger.reject_patch(&ledger_id, &reviewer, &reason).await?, &ledger_id, "rejected"),
        LedgerCommand::Apply {
            ledger_id,
            actor,
            record_only,
        } => {
            let changed = if record_only {
                ledger.mark_applied(&ledger_id, actor.as_deref()).await?
            } else {
                let worktrees = WorktreeManager::new(config.worktree.to_worktree_config());
                ledger.apply_patch(&ledger_id, &worktrees, actor.as_deref()).await?
            };
            report(changed, &ledger_id, "applied")
        }
    }
}

fn report(changed: bool, ledger_id: &str, verb: &str) -> Result<()> {
    if changed {
        println!("Patch {} {}", ledger_id.bold(), verb.green());
        Ok(())
    } else {
        Err(eyre::eyre!("Patch {} could not be {} from its current state", ledger_id, verb))
    }
}

fn print_entries(entries: &[PatchLedgerEntry], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(entries)?),
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No ledger entries found.");
            }
            for entry in entries {
                println!(
                    "{}  {}  patch={}  run={}",
                    entry.ledger_id.bold(),
                    entry.state,
                    entry.patch_id,
                    entry.run_id
                );
                if let Some(workstream) = &entry.workstream_id {
                    println!("    workstream: {}", workstream);
                }
            }
        }
    }
    Ok(())
}
