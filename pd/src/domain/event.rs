//! EventRecord - append-only log of everything the engine did

use std::collections::HashMap;

use patchstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::generate_id;

/// One persisted event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub run_id: Option<String>,
    /// Event kind, e.g. `run_state_changed` or `routing_decision`
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: i64,
}

impl EventRecord {
    pub fn new(run_id: Option<String>, kind: impl Into<String>, payload: Value) -> Self {
        let kind = kind.into();
        Self {
            event_id: generate_id("event", &kind),
            run_id,
            kind,
            payload,
            created_at: now_ms(),
        }
    }
}

impl Record for EventRecord {
    fn id(&self) -> &str {
        &self.event_id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "events"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("kind".to_string(), IndexValue::String(self.kind.clone()));
        if let Some(ref run_id) = self.run_id {
            fields.insert("run_id".to_string(), IndexValue::String(run_id.clone()));
        }
        fields
    }
}
