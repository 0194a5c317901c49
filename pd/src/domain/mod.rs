//! Domain types for PatchDaemon
//!
//! Tasks come from the planning layer; runs, sessions, ledger entries, events
//! and step attempts implement the Record trait for PatchStore persistence.

mod attempt;
mod event;
mod id;
mod lifecycle;
mod patch;
mod run;
mod session;
mod task;

pub use attempt::StepAttempt;
pub use event::EventRecord;
pub use id::{generate_id, slugify};
pub use lifecycle::{Lifecycle, TransitionError};
pub use patch::{LedgerAuditEntry, PatchLedgerEntry, PatchState};
pub use run::{RunRecord, RunState};
pub use session::{Session, SessionState};
pub use task::{Task, TaskGraphDocument, TaskStatus};

// Re-export patchstore types for convenience
pub use patchstore::{Filter, FilterOp, IndexValue, Record, Store};
