//! Task domain type and the task graph input document

use std::fmt;
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::lifecycle::Lifecycle;

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies
    #[default]
    Pending,
    /// All dependencies satisfied
    Ready,
    /// Tool invocation in progress
    Running,
    /// Finished and recorded
    Completed,
    /// Blocked, unroutable or otherwise unrecoverable
    Failed,
    /// Never ran: a dependency did not complete, or an execution loop was detected
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" | "complete" | "success" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

impl Lifecycle for TaskStatus {
    const ENTITY: &'static str = "task";

    fn allowed_transitions(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Ready, Self::Skipped, Self::Failed],
            Self::Ready => &[Self::Running, Self::Skipped, Self::Failed],
            // Running -> Ready is a retry after a failed attempt
            Self::Running => &[Self::Completed, Self::Failed, Self::Ready, Self::Skipped],
            Self::Completed | Self::Failed | Self::Skipped => &[],
        }
    }
}

/// One unit of work produced by the planning layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id within the graph
    pub task_id: String,

    /// What kind of work this is (drives routing)
    pub task_kind: String,

    /// Task ids that must complete first
    #[serde(default, rename = "depends_on", alias = "dependencies")]
    pub dependencies: Vec<String>,

    /// Free-form planning metadata
    #[serde(default)]
    pub metadata: Value,

    /// Current status
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    /// Create a task with no dependencies
    pub fn new(task_id: impl Into<String>, task_kind: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_kind: task_kind.into(),
            dependencies: Vec::new(),
            metadata: Value::Null,
            status: TaskStatus::Pending,
        }
    }

    /// Builder: set dependencies
    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set one metadata value
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(obj) = self.metadata.as_object_mut() {
            obj.insert(key.to_string(), value.into());
        }
        self
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    fn meta_list(&self, key: &str) -> Vec<String> {
        match self.metadata.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn risk_tier(&self) -> Option<&str> {
        self.meta_str("risk_tier")
    }

    pub fn complexity(&self) -> Option<&str> {
        self.meta_str("complexity")
    }

    pub fn domain(&self) -> Option<&str> {
        self.meta_str("domain")
    }

    /// Guardrail pattern governing this task (None = legacy mode)
    pub fn pattern_id(&self) -> Option<&str> {
        self.meta_str("pattern_id")
    }

    pub fn workstream_id(&self) -> Option<&str> {
        self.meta_str("workstream_id")
    }

    /// Operation kind for tool-profile routing
    pub fn operation_kind(&self) -> Option<&str> {
        self.meta_str("operation_kind")
    }

    /// Repository paths the task declares it will touch
    pub fn files(&self) -> Vec<String> {
        self.meta_list("files")
    }

    /// Extra tools the task declares it will use
    pub fn tools(&self) -> Vec<String> {
        self.meta_list("tools")
    }

    /// Operations the task requests (checked against forbidden operations)
    pub fn operations(&self) -> Vec<String> {
        self.meta_list("operations")
    }

    /// Output files that must exist after a successful run
    pub fn expected_outputs(&self) -> Vec<String> {
        self.meta_list("expected_outputs")
    }

    /// Update status (no validation; see [`crate::scheduler::TaskGraph::transition`])
    pub fn set_status(&mut self, status: TaskStatus) {
        debug!(task_id = %self.task_id, from = %self.status, to = %status, "Task::set_status: called");
        self.status = status;
    }
}

/// The JSON document produced by the planning layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraphDocument {
    pub tasks: Vec<Task>,
}

impl TaskGraphDocument {
    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse task graph document")
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        debug!(?path, "TaskGraphDocument::load: called");
        let content = std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        Self::from_json(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document() {
        let doc = TaskGraphDocument::from_json(
            r#"{"tasks": [
                {"task_id": "A", "task_kind": "code_edit", "depends_on": [], "metadata": {"risk_tier": "low"}},
                {"task_id": "B", "task_kind": "test_run", "depends_on": ["A"]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(doc.tasks.len(), 2);
        assert_eq!(doc.tasks[0].risk_tier(), Some("low"));
        assert_eq!(doc.tasks[1].dependencies, vec!["A".to_string()]);
        assert_eq!(doc.tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn test_metadata_lists_accept_scalar() {
        let task = Task::new("t", "edit").with_meta("files", "src/lib.rs");
        assert_eq!(task.files(), vec!["src/lib.rs".to_string()]);

        let task = Task::new("t", "edit").with_meta("files", serde_json::json!(["a.rs", "b.rs"]));
        assert_eq!(task.files().len(), 2);
        assert!(task.tools().is_empty());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(TaskStatus::Pending.check_transition("t", TaskStatus::Completed).is_err());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("complete".parse::<TaskStatus>().unwrap(), TaskStatus::Completed);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }
}
