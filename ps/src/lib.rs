//! PatchStore - embedded relational state for the patch daemon
//!
//! Every persisted entity (runs, sessions, events, step attempts, ledger
//! entries) implements [`Record`] and lives in its own SQLite table. Indexed
//! fields are mirrored into a shared `record_indexes` table so callers can
//! filter without deserializing every row.
//!
//! The store performs no locking of its own beyond SQLite's: callers are
//! expected to funnel writes through a single owner per process.

mod record;
mod store;

pub use record::{Filter, FilterOp, IndexValue, Record};
pub use store::{DB_FILE_NAME, Store};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
