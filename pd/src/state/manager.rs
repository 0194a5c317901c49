//! StateManager - actor that owns the Store
//!
//! Processes commands via channels for thread-safe access to persistent state.

use std::path::Path;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::domain::{
    EventRecord, Filter, PatchLedgerEntry, PatchState, Record, RunRecord, RunState, Session, SessionState,
    StepAttempt, Store,
};

use super::messages::{StateCommand, StateError, StateResponse};

/// Aggregated run counters
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunMetrics {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Handle to send commands to the StateManager
#[derive(Clone, Debug)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn a StateManager over the store in `store_dir`
    pub fn spawn(store_dir: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_dir = %store_dir.as_ref().display(), "spawn: called");
        let store = Store::open(store_dir.as_ref())?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn over a private in-memory store
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        debug!("spawn_in_memory: called");
        Ok(Self::spawn_with_store(Store::open_in_memory()?))
    }

    fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Runs ===

    pub async fn create_run(&self, run: RunRecord) -> StateResponse<String> {
        debug!(run_id = %run.run_id, "create_run: called");
        self.request(|reply| StateCommand::CreateRun { run, reply }).await
    }

    pub async fn get_run(&self, id: &str) -> StateResponse<Option<RunRecord>> {
        debug!(%id, "get_run: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::GetRun { id, reply }).await
    }

    pub async fn update_run(&self, run: RunRecord) -> StateResponse<()> {
        debug!(run_id = %run.run_id, state = %run.state, "update_run: called");
        self.request(|reply| StateCommand::UpdateRun { run, reply }).await
    }

    pub async fn list_runs(&self, state_filter: Option<RunState>) -> StateResponse<Vec<RunRecord>> {
        debug!(?state_filter, "list_runs: called");
        self.request(|reply| StateCommand::ListRuns { state_filter, reply }).await
    }

    /// Oldest pending runs first, at most `limit`
    pub async fn list_pending(&self, limit: usize) -> StateResponse<Vec<RunRecord>> {
        debug!(limit, "list_pending: called");
        let mut runs = self.list_runs(Some(RunState::Pending)).await?;
        runs.sort_by_key(|r| r.created_at);
        runs.truncate(limit);
        Ok(runs)
    }

    /// Validated transition plus metadata, written in one step
    ///
    /// A rejected transition leaves the persisted record unchanged.
    pub async fn transition_run(
        &self,
        id: &str,
        target: RunState,
        metadata: Vec<(String, Value)>,
    ) -> StateResponse<RunRecord> {
        debug!(%id, %target, "transition_run: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::TransitionRun {
            id,
            target,
            metadata,
            reply,
        })
        .await
    }

    pub async fn run_metrics(&self) -> StateResponse<RunMetrics> {
        debug!("run_metrics: called");
        let runs = self.list_runs(None).await?;
        let mut metrics = RunMetrics {
            total: runs.len() as u64,
            ..Default::default()
        };
        for run in &runs {
            match run.state {
                RunState::Pending => metrics.pending += 1,
                RunState::Running => metrics.running += 1,
                RunState::Succeeded => metrics.succeeded += 1,
                RunState::Failed => metrics.failed += 1,
            }
        }
        Ok(metrics)
    }

    // === Sessions ===

    pub async fn create_session(&self, session: Session) -> StateResponse<String> {
        debug!(session_id = %session.session_id, "create_session: called");
        self.request(|reply| StateCommand::CreateSession { session, reply }).await
    }

    pub async fn get_session(&self, id: &str) -> StateResponse<Option<Session>> {
        debug!(%id, "get_session: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::GetSession { id, reply }).await
    }

    pub async fn list_sessions(&self, project_filter: Option<String>) -> StateResponse<Vec<Session>> {
        debug!(?project_filter, "list_sessions: called");
        self.request(|reply| StateCommand::ListSessions { project_filter, reply }).await
    }

    pub async fn transition_session(&self, id: &str, target: SessionState) -> StateResponse<Session> {
        debug!(%id, %target, "transition_session: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::TransitionSession { id, target, reply })
            .await
    }

    // === Patch ledger ===

    pub async fn create_ledger_entry(&self, entry: PatchLedgerEntry) -> StateResponse<String> {
        debug!(ledger_id = %entry.ledger_id, "create_ledger_entry: called");
        self.request(|reply| StateCommand::CreateLedgerEntry { entry, reply }).await
    }

    pub async fn get_ledger_entry(&self, id: &str) -> StateResponse<Option<PatchLedgerEntry>> {
        debug!(%id, "get_ledger_entry: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::GetLedgerEntry { id, reply }).await
    }

    pub async fn update_ledger_entry(&self, entry: PatchLedgerEntry) -> StateResponse<()> {
        debug!(ledger_id = %entry.ledger_id, state = %entry.state, "update_ledger_entry: called");
        self.request(|reply| StateCommand::UpdateLedgerEntry { entry, reply }).await
    }

    /// Validated ledger transition with an audit entry, written in one step
    pub async fn transition_ledger_entry(
        &self,
        id: &str,
        target: PatchState,
        actor: Option<String>,
        comment: Option<String>,
    ) -> StateResponse<PatchLedgerEntry> {
        debug!(%id, %target, ?actor, "transition_ledger_entry: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::TransitionLedgerEntry {
            id,
            target,
            actor,
            comment,
            reply,
        })
        .await
    }

    pub async fn list_ledger_entries(
        &self,
        state_filter: Option<PatchState>,
        run_filter: Option<String>,
        workstream_filter: Option<String>,
    ) -> StateResponse<Vec<PatchLedgerEntry>> {
        debug!(?state_filter, ?run_filter, ?workstream_filter, "list_ledger_entries: called");
        self.request(|reply| StateCommand::ListLedgerEntries {
            state_filter,
            run_filter,
            workstream_filter,
            reply,
        })
        .await
    }

    // === Events ===

    pub async fn append_event(&self, event: EventRecord) -> StateResponse<String> {
        debug!(kind = %event.kind, "append_event: called");
        self.request(|reply| StateCommand::AppendEvent { event, reply }).await
    }

    pub async fn list_events(&self, run_filter: Option<String>) -> StateResponse<Vec<EventRecord>> {
        debug!(?run_filter, "list_events: called");
        self.request(|reply| StateCommand::ListEvents { run_filter, reply }).await
    }

    // === Step attempts ===

    pub async fn record_attempt(&self, attempt: StepAttempt) -> StateResponse<String> {
        debug!(attempt_id = %attempt.attempt_id, task_id = %attempt.task_id, "record_attempt: called");
        self.request(|reply| StateCommand::RecordAttempt { attempt, reply }).await
    }

    pub async fn list_attempts(&self, run_id: &str) -> StateResponse<Vec<StepAttempt>> {
        debug!(%run_id, "list_attempts: called");
        let run_id = run_id.to_string();
        self.request(|reply| StateCommand::ListAttempts { run_id, reply }).await
    }

    /// Shutdown the StateManager
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

fn store_err(e: eyre::Report) -> StateError {
    StateError::StoreError(e.to_string())
}

fn eq_filter(filters: &mut Vec<Filter>, field: &str, value: Option<String>) {
    if let Some(value) = value {
        filters.push(Filter::eq(field, value));
    }
}

/// Load, mutate and write back one record; `NotFound` if missing
fn modify<T, F>(store: &mut Store, id: &str, apply: F) -> StateResponse<T>
where
    T: Record + Clone,
    F: FnOnce(&mut T) -> StateResponse<()>,
{
    let mut record: T = store
        .get(id)
        .map_err(store_err)?
        .ok_or_else(|| StateError::NotFound(id.to_string()))?;
    apply(&mut record)?;
    store.update(record.clone()).map_err(store_err)?;
    Ok(record)
}

async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateRun { run, reply } => {
                debug!(run_id = %run.run_id, "actor_loop: CreateRun command");
                let _ = reply.send(store.create(run).map_err(store_err));
            }

            StateCommand::GetRun { id, reply } => {
                debug!(%id, "actor_loop: GetRun command");
                let _ = reply.send(store.get(&id).map_err(store_err));
            }

            StateCommand::UpdateRun { run, reply } => {
                debug!(run_id = %run.run_id, "actor_loop: UpdateRun command");
                let _ = reply.send(store.update(run).map_err(store_err));
            }

            StateCommand::ListRuns { state_filter, reply } => {
                debug!(?state_filter, "actor_loop: ListRuns command");
                let mut filters = Vec::new();
                eq_filter(&mut filters, "state", state_filter.map(|s| s.to_string()));
                let _ = reply.send(store.list(&filters).map_err(store_err));
            }

            StateCommand::TransitionRun {
                id,
                target,
                metadata,
                reply,
            } => {
                debug!(%id, %target, "actor_loop: TransitionRun command");
                let result = modify(&mut store, &id, |run: &mut RunRecord| {
                    run.transition(target)?;
                    for (key, value) in metadata {
                        if key == "error" {
                            if let Some(error) = value.as_str() {
                                run.record_fatal_error(error);
                            }
                        } else {
                            run.set_meta(&key, value);
                        }
                    }
                    Ok(())
                });
                let _ = reply.send(result);
            }

            StateCommand::CreateSession { session, reply } => {
                debug!(session_id = %session.session_id, "actor_loop: CreateSession command");
                let _ = reply.send(store.create(session).map_err(store_err));
            }

            StateCommand::GetSession { id, reply } => {
                debug!(%id, "actor_loop: GetSession command");
                let _ = reply.send(store.get(&id).map_err(store_err));
            }

            StateCommand::ListSessions { project_filter, reply } => {
                debug!(?project_filter, "actor_loop: ListSessions command");
                let mut filters = Vec::new();
                eq_filter(&mut filters, "project_id", project_filter);
                let _ = reply.send(store.list(&filters).map_err(store_err));
            }

            StateCommand::TransitionSession { id, target, reply } => {
                debug!(%id, %target, "actor_loop: TransitionSession command");
                let result = modify(&mut store, &id, |session: &mut Session| {
                    session.transition(target)?;
                    Ok(())
                });
                let _ = reply.send(result);
            }

            StateCommand::CreateLedgerEntry { entry, reply } => {
                debug!(ledger_id = %entry.ledger_id, "actor_loop: CreateLedgerEntry command");
                let _ = reply.send(store.create(entry).map_err(store_err));
            }

            StateCommand::GetLedgerEntry { id, reply } => {
                debug!(%id, "actor_loop: GetLedgerEntry command");
                let _ = reply.send(store.get(&id).map_err(store_err));
            }

            StateCommand::UpdateLedgerEntry { entry, reply } => {
                debug!(ledger_id = %entry.ledger_id, "actor_loop: UpdateLedgerEntry command");
                let _ = reply.send(store.update(entry).map_err(store_err));
            }

            StateCommand::TransitionLedgerEntry {
                id,
                target,
                actor,
                comment,
                reply,
            } => {
                debug!(%id, %target, "actor_loop: TransitionLedgerEntry command");
                let result = modify(&mut store, &id, |entry: &mut PatchLedgerEntry| {
                    entry.transition(target, actor.as_deref(), comment.as_deref())?;
                    Ok(())
                });
                let _ = reply.send(result);
            }

            StateCommand::ListLedgerEntries {
                state_filter,
                run_filter,
                workstream_filter,
                reply,
            } => {
                debug!(?state_filter, ?run_filter, ?workstream_filter, "actor_loop: ListLedgerEntries command");
                let mut filters = Vec::new();
                eq_filter(&mut filters, "state", state_filter.map(|s| s.to_string()));
                eq_filter(&mut filters, "run_id", run_filter);
                eq_filter(&mut filters, "workstream_id", workstream_filter);
                let _ = reply.send(store.list(&filters).map_err(store_err));
            }

            StateCommand::AppendEvent { event, reply } => {
                debug!(kind = %event.kind, "actor_loop: AppendEvent command");
                let _ = reply.send(store.create(event).map_err(store_err));
            }

            StateCommand::ListEvents { run_filter, reply } => {
                debug!(?run_filter, "actor_loop: ListEvents command");
                let mut filters = Vec::new();
                eq_filter(&mut filters, "run_id", run_filter);
                let _ = reply.send(store.list(&filters).map_err(store_err));
            }

            StateCommand::RecordAttempt { attempt, reply } => {
                debug!(attempt_id = %attempt.attempt_id, "actor_loop: RecordAttempt command");
                let _ = reply.send(store.create(attempt).map_err(store_err));
            }

            StateCommand::ListAttempts { run_id, reply } => {
                debug!(%run_id, "actor_loop: ListAttempts command");
                let filters = vec![Filter::eq("run_id", run_id)];
                let _ = reply.send(store.list(&filters).map_err(store_err));
            }

            StateCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
