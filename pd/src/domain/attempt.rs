//! StepAttempt - one tool invocation for one task

use std::collections::HashMap;

use patchstore::{IndexValue, Record};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub attempt_id: String,
    pub run_id: String,
    pub task_id: String,
    pub tool_id: String,
    pub exit_code: i32,
    #[serde(default)]
    pub timed_out: bool,
    pub duration_ms: u64,
    /// Worktree the tool ran in
    pub worktree: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
}

impl StepAttempt {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            attempt_id: generate_id("attempt", &task_id),
            run_id: run_id.into(),
            task_id,
            tool_id: tool_id.into(),
            exit_code: 0,
            timed_out: false,
            duration_ms: 0,
            worktree: None,
            started_at: 0,
            finished_at: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

impl Record for StepAttempt {
    fn id(&self) -> &str {
        &self.attempt_id
    }

    fn updated_at(&self) -> i64 {
        self.finished_at
    }

    fn collection_name() -> &'static str {
        "step_attempts"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("run_id".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("task_id".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("tool_id".to_string(), IndexValue::String(self.tool_id.clone()));
        fields.insert("exit_code".to_string(), IndexValue::Int(i64::from(self.exit_code)));
        fields
    }
}
