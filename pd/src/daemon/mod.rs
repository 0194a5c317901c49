//! Run daemon: PID file, child process supervision and the poll loop

mod orchestrator;
mod pidfile;
mod process;

pub use orchestrator::{DaemonOrchestrator, OrchestratorStatus, TrackedRunStatus};
pub use pidfile::{DaemonManager, DaemonStatus, is_process_running};
pub use process::{ChildProcess, OsProcessSpawner, ProcessSpawner, RunLogPaths};

use thiserror::Error;

use crate::state::StateError;

/// Errors from run supervision
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to spawn run process: {0}")]
    SpawnFailed(String),

    #[error("Failed to signal process: {0}")]
    Signal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] StateError),
}
