//! PatchLedger - state-machine facade over persisted ledger entries
//!
//! Out-of-order transitions are not errors here: every transition method
//! returns `Ok(false)` and leaves the entry untouched so callers can branch.

use tracing::{debug, info, warn};

use eyre::Context;

use crate::domain::{PatchLedgerEntry, PatchState};
use crate::events::EventEmitter;
use crate::state::{StateError, StateManager, StateResponse};
use crate::worktree::WorktreeManager;

#[derive(Clone)]
pub struct PatchLedger {
    state: StateManager,
    emitter: Option<EventEmitter>,
}

impl PatchLedger {
    pub fn new(state: StateManager) -> Self {
        debug!("PatchLedger::new: called");
        Self { state, emitter: None }
    }

    /// Publish every accepted transition on the event bus
    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Record a freshly produced patch in `created`
    pub async fn create_entry(
        &self,
        patch_id: &str,
        run_id: &str,
        workstream_id: Option<&str>,
        metadata: Vec<(String, serde_json::Value)>,
    ) -> StateResponse<PatchLedgerEntry> {
        debug!(%patch_id, %run_id, ?workstream_id, "PatchLedger::create_entry: called");
        let mut entry = PatchLedgerEntry::new(patch_id, run_id, workstream_id.map(str::to_string));
        for (key, value) in metadata {
            entry = entry.with_meta(&key, value);
        }
        self.state.create_ledger_entry(entry.clone()).await?;
        info!(ledger_id = %entry.ledger_id, %patch_id, %run_id, "Patch ledger entry created");
        Ok(entry)
    }

    pub async fn get(&self, ledger_id: &str) -> StateResponse<Option<PatchLedgerEntry>> {
        self.state.get_ledger_entry(ledger_id).await
    }

    /// `created -> validated`
    pub async fn mark_validated(&self, ledger_id: &str) -> StateResponse<bool> {
        self.transition(ledger_id, PatchState::Validated, None, None).await
    }

    /// `validated -> awaiting_review`
    pub async fn mark_for_review(&self, ledger_id: &str) -> StateResponse<bool> {
        self.transition(ledger_id, PatchState::AwaitingReview, None, None).await
    }

    /// `awaiting_review -> queued`
    pub async fn approve_patch(&self, ledger_id: &str, reviewer: &str, comment: Option<&str>) -> StateResponse<bool> {
        self.transition(ledger_id, PatchState::Queued, Some(reviewer), comment).await
    }

    /// `awaiting_review -> dropped`
    pub async fn reject_patch(&self, ledger_id: &str, reviewer: &str, reason: &str) -> StateResponse<bool> {
        self.transition(ledger_id, PatchState::Dropped, Some(reviewer), Some(reason)).await
    }

    /// `queued -> applied`
    pub async fn mark_applied(&self, ledger_id: &str, actor: Option<&str>) -> StateResponse<bool> {
        self.transition(ledger_id, PatchState::Applied, actor, None).await
    }

    /// Cherry-pick a queued patch's commit onto the main checkout, then record `queued -> applied`
    ///
    /// Entries that are missing or not queued return `Ok(false)` without touching git.
    /// A failed cherry-pick leaves the entry queued.
    pub async fn apply_patch(
        &self,
        ledger_id: &str,
        worktrees: &WorktreeManager,
        actor: Option<&str>,
    ) -> eyre::Result<bool> {
        debug!(%ledger_id, ?actor, "PatchLedger::apply_patch: called");
        let Some(entry) = self.get(ledger_id).await? else {
            warn!(%ledger_id, "Patch ledger entry not found");
            return Ok(false);
        };
        if entry.state != PatchState::Queued {
            warn!(%ledger_id, state = %entry.state, "Only queued patches can be applied");
            return Ok(false);
        }
        let head = worktrees
            .apply_commit(&entry.patch_id)
            .await
            .context(format!("Failed to apply patch {}", ledger_id))?;
        info!(%ledger_id, patch_id = %entry.patch_id, %head, "Patch applied to main checkout");
        Ok(self.mark_applied(ledger_id, actor).await?)
    }

    async fn transition(
        &self,
        ledger_id: &str,
        target: PatchState,
        actor: Option<&str>,
        comment: Option<&str>,
    ) -> StateResponse<bool> {
        debug!(%ledger_id, %target, ?actor, "PatchLedger::transition: called");
        let result = self
            .state
            .transition_ledger_entry(ledger_id, target, actor.map(str::to_string), comment.map(str::to_string))
            .await;
        match result {
            Ok(entry) => {
                if let Some(emitter) = &self.emitter
                    && let Some(last) = entry.history().last()
                {
                    emitter.patch_state_changed(&entry.ledger_id, last.from, last.to);
                }
                Ok(true)
            }
            Err(StateError::InvalidTransition(e)) => {
                warn!(%ledger_id, error = %e, "Rejected patch ledger transition");
                Ok(false)
            }
            Err(StateError::NotFound(_)) => {
                warn!(%ledger_id, %target, "Patch ledger entry not found");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Human review queue, oldest first
    pub async fn list_awaiting_review(
        &self,
        run_id: Option<&str>,
        workstream_id: Option<&str>,
    ) -> StateResponse<Vec<PatchLedgerEntry>> {
        debug!(?run_id, ?workstream_id, "PatchLedger::list_awaiting_review: called");
        self.list(Some(PatchState::AwaitingReview), run_id, workstream_id).await
    }

    pub async fn list(
        &self,
        state: Option<PatchState>,
        run_id: Option<&str>,
        workstream_id: Option<&str>,
    ) -> StateResponse<Vec<PatchLedgerEntry>> {
        self.state
            .list_ledger_entries(state, run_id.map(str::to_string), workstream_id.map(str::to_string))
            .await
    }
}
