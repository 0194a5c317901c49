//! RunRecord domain type
//!
//! A run is one execution of a full task graph. The planning layer creates it
//! as PENDING; the daemon moves it through the rest of its lifecycle.

use std::collections::HashMap;
use std::fmt;

use patchstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::id::generate_id;
use super::lifecycle::{Lifecycle, TransitionError};

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            _ => Err(format!("Unknown run state: {}", s)),
        }
    }
}

impl Lifecycle for RunState {
    const ENTITY: &'static str = "run";

    fn allowed_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Succeeded, Self::Failed],
            Self::Succeeded | Self::Failed => &[],
        }
    }
}

/// Persisted run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub project_id: String,
    pub phase_id: String,
    pub state: RunState,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
    /// Graph path, pid, exit code, first fatal error, ...
    #[serde(default)]
    pub metadata: Value,
}

impl RunRecord {
    /// Create a new PENDING run with a generated id
    pub fn new(project_id: impl Into<String>, phase_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let phase_id = phase_id.into();
        let run_id = generate_id("run", &format!("{}-{}", project_id, phase_id));
        Self::with_id(run_id, project_id, phase_id)
    }

    /// Create with a specific id (for testing or recovery)
    pub fn with_id(run_id: impl Into<String>, project_id: impl Into<String>, phase_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            run_id: run_id.into(),
            project_id: project_id.into(),
            phase_id: phase_id.into(),
            state: RunState::Pending,
            created_at: now,
            updated_at: now,
            metadata: serde_json::json!({}),
        }
    }

    /// Builder: set a metadata value
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set_meta(key, value);
        self
    }

    /// Set a metadata value
    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(obj) = self.metadata.as_object_mut() {
            obj.insert(key.to_string(), value.into());
        }
        self.updated_at = now_ms();
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Path to the task graph document, if the planning layer recorded one
    pub fn graph_path(&self) -> Option<&str> {
        self.meta_str("graph_path")
    }

    /// Record the first fatal error; later errors never overwrite it
    pub fn record_fatal_error(&mut self, error: impl Into<String>) {
        if self.meta_str("error").is_none() {
            let error = error.into();
            debug!(run_id = %self.run_id, %error, "RunRecord::record_fatal_error: recording");
            self.set_meta("error", error);
        }
    }

    /// Move to `target`, leaving the record untouched on rejection
    pub fn transition(&mut self, target: RunState) -> Result<(), TransitionError> {
        self.state.check_transition(&self.run_id, target)?;
        info!(run_id = %self.run_id, from = %self.state, to = %target, "Run state transition");
        self.state = target;
        self.updated_at = now_ms();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl Record for RunRecord {
    fn id(&self) -> &str {
        &self.run_id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "runs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("state".to_string(), IndexValue::String(self.state.to_string()));
        fields.insert("project_id".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("phase_id".to_string(), IndexValue::String(self.phase_id.clone()));
        fields.insert("created_at".to_string(), IndexValue::Int(self.created_at));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_pending() {
        let run = RunRecord::new("proj", "phase-1");
        assert_eq!(run.state, RunState::Pending);
        assert!(run.run_id.contains("-run-"));
    }

    #[test]
    fn test_valid_transitions() {
        let mut run = RunRecord::with_id("r1", "p", "ph");
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::Succeeded).unwrap();
        assert!(run.is_terminal());
    }

    #[test]
    fn test_rejected_transition_leaves_state() {
        let mut run = RunRecord::with_id("r1", "p", "ph");
        let err = run.transition(RunState::Succeeded).unwrap_err();
        assert_eq!(err.from, "PENDING");
        assert_eq!(err.to, "SUCCEEDED");
        assert_eq!(run.state, RunState::Pending);
    }

    #[test]
    fn test_first_fatal_error_wins() {
        let mut run = RunRecord::with_id("r1", "p", "ph");
        run.record_fatal_error("cycle detected");
        run.record_fatal_error("later problem");
        assert_eq!(run.meta_str("error"), Some("cycle detected"));
    }

    #[test]
    fn test_state_serde_is_uppercase() {
        let json = serde_json::to_string(&RunState::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }
}
