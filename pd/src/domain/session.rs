//! Session domain type - a long-lived agent handle

use std::collections::HashMap;
use std::fmt;

use patchstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::id::generate_id;
use super::lifecycle::{Lifecycle, TransitionError};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Created,
    Active,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown session state: {}", s)),
        }
    }
}

impl Lifecycle for SessionState {
    const ENTITY: &'static str = "session";

    fn allowed_transitions(&self) -> &'static [Self] {
        match self {
            Self::Created => &[Self::Active, Self::Failed],
            Self::Active => &[Self::Paused, Self::Completed, Self::Failed],
            Self::Paused => &[Self::Active, Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }
}

/// Persisted agent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub project_id: String,
    pub agent_type: String,
    pub state: SessionState,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub metadata: Value,
}

impl Session {
    pub fn new(project_id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let agent_type = agent_type.into();
        let now = now_ms();
        Self {
            session_id: generate_id("session", &agent_type),
            project_id,
            agent_type,
            state: SessionState::Created,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
        }
    }

    /// Move to `target`, leaving the session untouched on rejection
    pub fn transition(&mut self, target: SessionState) -> Result<(), TransitionError> {
        self.state.check_transition(&self.session_id, target)?;
        info!(session_id = %self.session_id, from = %self.state, to = %target, "Session state transition");
        self.state = target;
        self.updated_at = now_ms();
        Ok(())
    }
}

impl Record for Session {
    fn id(&self) -> &str {
        &self.session_id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "sessions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("state".to_string(), IndexValue::String(self.state.to_string()));
        fields.insert("project_id".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("agent_type".to_string(), IndexValue::String(self.agent_type.clone()));
        fields
    }
}
