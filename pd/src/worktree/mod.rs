//! Git worktree isolation
//!
//! Each run (optionally each step) works in its own worktree and branch, so
//! concurrent tasks never collide on files.

mod manager;
mod porcelain;

pub use manager::{ChangeSummary, WorktreeConfig, WorktreeError, WorktreeInfo, WorktreeManager};
pub use porcelain::{PorcelainEntry, parse_worktree_list};
