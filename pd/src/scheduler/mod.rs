//! Dependency scheduler
//!
//! [`TaskGraph`] holds the tasks of one run and answers ordering questions;
//! [`Frontier`] is the incremental view the run orchestrator drains.

mod frontier;
mod graph;

pub use frontier::Frontier;
pub use graph::{GraphError, TaskGraph};
