//! PatchDaemon - execution engine for task graphs of code modifications
//!
//! An upstream planning layer produces a graph of tasks; PatchDaemon runs it
//! against a real repository using external command-line tools, one isolated
//! git worktree per run, and gates every produced patch behind review.
//!
//! # Modules
//!
//! - [`scheduler`] - Task graph ordering, cycle detection and the ready frontier
//! - [`router`] - Capability and strategy based tool selection with feedback
//! - [`worktree`] - Git worktree isolation, archiving and pruning
//! - [`executor`] - Tool adapters, guardrails and loop detection
//! - [`ledger`] - Review-gated patch lifecycle
//! - [`orchestrator`] - Drives one run's graph to completion
//! - [`daemon`] - PID file and the bounded-concurrency run supervisor
//! - [`state`] - Actor over the embedded store
//! - [`events`] - Broadcast bus and event recorder
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod router;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod worktree;

// Re-export commonly used types
pub use config::{Config, DaemonConfig};
pub use daemon::{DaemonError, DaemonManager, DaemonOrchestrator, OsProcessSpawner};
pub use domain::{
    PatchLedgerEntry, PatchState, RunRecord, RunState, Session, SessionState, StepAttempt, Task, TaskGraphDocument,
    TaskStatus, TransitionError,
};
pub use events::{EventBus, EventEmitter, PdEvent};
pub use executor::{ExecutionResult, ExecutionStatus, Executor, Guardrails, LoopDetector, ToolAdapter, ToolOutcome};
pub use ledger::PatchLedger;
pub use orchestrator::{RunOptions, RunOrchestrator, RunSummary, Workspace};
pub use router::{RouterConfig, RouterError, RoutingDecision, TaskRouter};
pub use scheduler::{Frontier, GraphError, TaskGraph};
pub use session::SessionManager;
pub use state::{StateError, StateManager};
pub use worktree::{WorktreeConfig, WorktreeError, WorktreeManager};
