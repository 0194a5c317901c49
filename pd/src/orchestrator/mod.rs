//! Per-run orchestration: drive one task graph to completion

mod run;

pub use run::{RunOptions, RunOrchestrator, RunSummary, Workspace};
