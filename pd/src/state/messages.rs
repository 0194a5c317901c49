//! State manager messages
//!
//! Commands and responses for the actor pattern.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{
    EventRecord, PatchLedgerEntry, PatchState, RunRecord, RunState, Session, SessionState, StepAttempt,
    TransitionError,
};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResponse<T>>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Runs
    CreateRun {
        run: RunRecord,
        reply: Reply<String>,
    },
    GetRun {
        id: String,
        reply: Reply<Option<RunRecord>>,
    },
    UpdateRun {
        run: RunRecord,
        reply: Reply<()>,
    },
    ListRuns {
        state_filter: Option<RunState>,
        reply: Reply<Vec<RunRecord>>,
    },
    /// Validated state change plus metadata, applied atomically
    TransitionRun {
        id: String,
        target: RunState,
        metadata: Vec<(String, Value)>,
        reply: Reply<RunRecord>,
    },

    // Sessions
    CreateSession {
        session: Session,
        reply: Reply<String>,
    },
    GetSession {
        id: String,
        reply: Reply<Option<Session>>,
    },
    ListSessions {
        project_filter: Option<String>,
        reply: Reply<Vec<Session>>,
    },
    TransitionSession {
        id: String,
        target: SessionState,
        reply: Reply<Session>,
    },

    // Patch ledger
    CreateLedgerEntry {
        entry: PatchLedgerEntry,
        reply: Reply<String>,
    },
    GetLedgerEntry {
        id: String,
        reply: Reply<Option<PatchLedgerEntry>>,
    },
    TransitionLedgerEntry {
        id: String,
        target: PatchState,
        actor: Option<String>,
        comment: Option<String>,
        reply: Reply<PatchLedgerEntry>,
    },
    UpdateLedgerEntry {
        entry: PatchLedgerEntry,
        reply: Reply<()>,
    },
    ListLedgerEntries {
        state_filter: Option<PatchState>,
        run_filter: Option<String>,
        workstream_filter: Option<String>,
        reply: Reply<Vec<PatchLedgerEntry>>,
    },

    // Events
    AppendEvent {
        event: EventRecord,
        reply: Reply<String>,
    },
    ListEvents {
        run_filter: Option<String>,
        reply: Reply<Vec<EventRecord>>,
    },

    // Step attempts
    RecordAttempt {
        attempt: StepAttempt,
        reply: Reply<String>,
    },
    ListAttempts {
        run_id: String,
        reply: Reply<Vec<StepAttempt>>,
    },

    // Shutdown
    Shutdown,
}
