//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// PatchDaemon - execution engine for task graphs of code modifications
#[derive(Parser)]
#[command(
    name = "pd",
    about = "Run task graphs of automated code modifications in isolated worktrees",
    version,
    after_help = "Logs are written to: ~/.local/share/patchdaemon/logs/patchdaemon.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(short, long, global = true, help = "Log level: trace, debug, info, warn, error")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Manage the background run daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Internal: Run as daemon process (used by `daemon start`)
    #[command(hide = true)]
    RunDaemon,

    /// Queue a task graph as a new pending run
    Submit {
        /// Task graph JSON document
        #[arg(short, long)]
        graph: PathBuf,

        /// Project the run belongs to
        #[arg(short, long, default_value = "default")]
        project: String,

        /// Planning phase that produced the graph
        #[arg(long, default_value = "manual")]
        phase: String,
    },

    /// Execute one run in the foreground
    Run {
        /// Run id (created if it does not exist yet)
        run_id: String,

        /// Task graph JSON document (defaults to the run's recorded graph)
        #[arg(short, long)]
        graph: Option<PathBuf>,
    },

    /// List runs
    Runs {
        /// Only runs in this state
        #[arg(short, long)]
        state: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Inspect and review produced patches
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
}

/// Daemon lifecycle subcommands
#[derive(Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the background
    Start {
        /// Don't fork to background (run in foreground)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Patch ledger subcommands
#[derive(Subcommand)]
pub enum LedgerCommand {
    /// List ledger entries
    List {
        /// Only entries in this state
        #[arg(short, long)]
        state: Option<String>,

        /// Only entries from this run
        #[arg(short, long)]
        run: Option<String>,

        /// Only entries from this workstream
        #[arg(short, long)]
        workstream: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List patches awaiting review
    Review {
        /// Only entries from this run
        #[arg(short, long)]
        run: Option<String>,
    },

    /// Approve a patch (awaiting_review -> queued)
    Approve {
        ledger_id: String,

        #[arg(short, long)]
        reviewer: String,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Reject a patch (awaiting_review -> dropped)
    Reject {
        ledger_id: String,

        #[arg(short, long)]
        reviewer: String,

        #[arg(long)]
        reason: String,
    },

    /// Cherry-pick a queued patch onto the main checkout and mark it applied
    Apply {
        ledger_id: String,

        #[arg(short, long)]
        actor: Option<String>,

        /// Only record the state change; the commit was landed some other way
        #[arg(long)]
        record_only: bool,
    },
}

/// Output format for status/list commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patchdaemon")
        .join("logs")
        .join("patchdaemon.log")
}
