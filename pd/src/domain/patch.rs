//! PatchLedgerEntry domain type
//!
//! ```text
//! created -> validated -> awaiting_review -> queued -> applied
//!                                        \-> dropped
//! ```

use std::collections::HashMap;
use std::fmt;

use patchstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::id::generate_id;
use super::lifecycle::{Lifecycle, TransitionError};

/// Patch lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    #[default]
    Created,
    Validated,
    AwaitingReview,
    Queued,
    Applied,
    Dropped,
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Validated => write!(f, "validated"),
            Self::AwaitingReview => write!(f, "awaiting_review"),
            Self::Queued => write!(f, "queued"),
            Self::Applied => write!(f, "applied"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

impl std::str::FromStr for PatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "validated" => Ok(Self::Validated),
            "awaiting_review" => Ok(Self::AwaitingReview),
            "queued" => Ok(Self::Queued),
            "applied" => Ok(Self::Applied),
            "dropped" => Ok(Self::Dropped),
            _ => Err(format!("Unknown patch state: {}", s)),
        }
    }
}

impl Lifecycle for PatchState {
    const ENTITY: &'static str = "patch";

    fn allowed_transitions(&self) -> &'static [Self] {
        match self {
            Self::Created => &[Self::Validated],
            Self::Validated => &[Self::AwaitingReview],
            Self::AwaitingReview => &[Self::Queued, Self::Dropped],
            Self::Queued => &[Self::Applied],
            Self::Applied | Self::Dropped => &[],
        }
    }
}

/// One step of an entry's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerAuditEntry {
    pub from: PatchState,
    pub to: PatchState,
    pub actor: Option<String>,
    pub comment: Option<String>,
    pub timestamp: i64,
}

/// Persisted state-machine record for one produced patch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchLedgerEntry {
    pub ledger_id: String,
    pub patch_id: String,
    pub run_id: String,
    pub workstream_id: Option<String>,
    pub state: PatchState,
    pub created_at: i64,
    pub updated_at: i64,
    /// Caller metadata plus the `history` audit trail
    #[serde(default)]
    pub metadata: Value,
}

impl PatchLedgerEntry {
    pub fn new(patch_id: impl Into<String>, run_id: impl Into<String>, workstream_id: Option<String>) -> Self {
        let patch_id = patch_id.into();
        let now = now_ms();
        Self {
            ledger_id: generate_id("patch", &patch_id),
            patch_id,
            run_id: run_id.into(),
            workstream_id,
            state: PatchState::Created,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({ "history": [] }),
        }
    }

    /// Builder: set a metadata value (the `history` key is reserved)
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        if key != "history"
            && let Some(obj) = self.metadata.as_object_mut()
        {
            obj.insert(key.to_string(), value.into());
        }
        self
    }

    /// Audit trail, oldest first
    pub fn history(&self) -> Vec<LedgerAuditEntry> {
        self.metadata
            .get("history")
            .cloned()
            .and_then(|h| serde_json::from_value(h).ok())
            .unwrap_or_default()
    }

    /// Move to `target`, appending to the audit trail; untouched on rejection
    pub fn transition(
        &mut self,
        target: PatchState,
        actor: Option<&str>,
        comment: Option<&str>,
    ) -> Result<(), TransitionError> {
        self.state.check_transition(&self.ledger_id, target)?;
        let now = now_ms();
        let audit = LedgerAuditEntry {
            from: self.state,
            to: target,
            actor: actor.map(str::to_string),
            comment: comment.map(str::to_string),
            timestamp: now,
        };
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(obj) = self.metadata.as_object_mut() {
            let history = obj.entry("history").or_insert_with(|| Value::Array(Vec::new()));
            if !history.is_array() {
                *history = Value::Array(Vec::new());
            }
            if let (Some(items), Ok(value)) = (history.as_array_mut(), serde_json::to_value(&audit)) {
                items.push(value);
            }
        }
        info!(ledger_id = %self.ledger_id, from = %self.state, to = %target, ?actor, "Patch ledger transition");
        self.state = target;
        self.updated_at = now;
        Ok(())
    }
}

impl Record for PatchLedgerEntry {
    fn id(&self) -> &str {
        &self.ledger_id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "patch_ledger"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("state".to_string(), IndexValue::String(self.state.to_string()));
        fields.insert("run_id".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("patch_id".to_string(), IndexValue::String(self.patch_id.clone()));
        if let Some(ref workstream) = self.workstream_id {
            fields.insert("workstream_id".to_string(), IndexValue::String(workstream.clone()));
        }
        fields
    }
}
