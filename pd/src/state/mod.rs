//! State management - actor pattern over PatchStore
//!
//! The StateManager owns the Store and processes commands via channels, so
//! every write in a process goes through one owner.

mod manager;
mod messages;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
