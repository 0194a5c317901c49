//! Executor: route, guard, invoke and record one task
//!
//! Tool failures never escape as errors. Only store failures do, since those
//! mean the run can no longer record anything.
//!
//! A worktree only ever moves forward by committed patches: whatever a failed
//! or blocked tool left behind is thrown away before the next task runs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use patchstore::now_ms;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::adapter::{ToolAdapter, ToolOutcome, ToolRequest, resolve_adapters};
use super::guardrails::{CheckReport, Guardrails, PatternGuardrails, PatternRegistry, ToolReport, Violation};
use crate::domain::{StepAttempt, Task};
use crate::events::EventEmitter;
use crate::ledger::PatchLedger;
use crate::router::TaskRouter;
use crate::state::{StateError, StateManager};
use crate::worktree::{ChangeSummary, WorktreeManager};

/// Exit code reported for tasks that never reached a tool
pub const EXIT_NOT_RUN: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    /// Tool failed, timed out, or a post-check found a critical problem
    Failed,
    /// A pre-check found a critical problem; the tool never ran
    Blocked,
    /// No tool can handle the task
    Unroutable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub status: ExecutionStatus,
    pub tool_id: Option<String>,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub output_patch_id: Option<String>,
    pub ledger_id: Option<String>,
    pub error: Option<String>,
    pub violations: Vec<Violation>,
}

impl ExecutionResult {
    fn not_run(task: &Task, status: ExecutionStatus, tool_id: Option<String>, error: String) -> Self {
        Self {
            task_id: task.task_id.clone(),
            status,
            tool_id,
            exit_code: EXIT_NOT_RUN,
            timed_out: false,
            duration_ms: 0,
            output_patch_id: None,
            ledger_id: None,
            error: Some(error),
            violations: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

pub struct Executor {
    run_id: String,
    router: TaskRouter,
    state: StateManager,
    ledger: PatchLedger,
    guardrails: Arc<dyn Guardrails>,
    adapters: BTreeMap<String, Arc<dyn ToolAdapter>>,
    adapter_override: Option<Arc<dyn ToolAdapter>>,
    worktrees: Option<Arc<WorktreeManager>>,
    emitter: Option<EventEmitter>,
    submit_for_review: bool,
}

impl Executor {
    /// Adapters are resolved from the router's `apps` once, here
    ///
    /// Guardrails start from an empty pattern registry: every task runs in
    /// legacy mode, but hallucinated success is still caught.
    pub fn new(run_id: impl Into<String>, router: TaskRouter, state: StateManager) -> Self {
        let run_id = run_id.into();
        debug!(%run_id, "Executor::new: called");
        let adapters = resolve_adapters(router.config());
        Self {
            ledger: PatchLedger::new(state.clone()),
            run_id,
            router,
            state,
            guardrails: Arc::new(PatternGuardrails::new(PatternRegistry::default())),
            adapters,
            adapter_override: None,
            worktrees: None,
            emitter: None,
            submit_for_review: true,
        }
    }

    pub fn with_guardrails(mut self, guardrails: Arc<dyn Guardrails>) -> Self {
        self.guardrails = guardrails;
        self
    }

    /// Use one adapter for every tool (dry runs, tests)
    pub fn with_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.adapter_override = Some(adapter);
        self
    }

    /// Worktree manager used to observe, and commit, what a tool changed
    pub fn with_worktrees(mut self, worktrees: Arc<WorktreeManager>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.ledger = self.ledger.with_emitter(emitter.clone());
        self.emitter = Some(emitter);
        self
    }

    /// Stop validated patches at `validated` instead of queueing them for review
    pub fn with_review(mut self, submit_for_review: bool) -> Self {
        self.submit_for_review = submit_for_review;
        self
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn router_mut(&mut self) -> &mut TaskRouter {
        &mut self.router
    }

    pub fn ledger(&self) -> &PatchLedger {
        &self.ledger
    }

    fn adapter_for(&self, tool_id: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.adapter_override
            .clone()
            .or_else(|| self.adapters.get(tool_id).cloned())
    }

    fn publish(&self, task: &Task, report: &CheckReport) {
        if let Some(emitter) = &self.emitter {
            for v in &report.violations {
                emitter.guardrail_violation(&task.task_id, &v.kind.to_string(), &v.severity.to_string(), &v.message);
            }
        }
    }

    /// Run one task inside `worktree`
    pub async fn execute(&mut self, task: &Task, worktree: &Path) -> Result<ExecutionResult, StateError> {
        debug!(task_id = %task.task_id, ?worktree, "Executor::execute: called");

        let decision = match self.router.route_task(task, Some(&self.run_id)) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Task is unroutable");
                if let Some(emitter) = &self.emitter {
                    emitter.error(&format!("route {}", task.task_id), &e.to_string());
                }
                return Ok(ExecutionResult::not_run(task, ExecutionStatus::Unroutable, None, e.to_string()));
            }
        };
        let tool_id = decision.selected_tool;

        let pre = self.guardrails.pre_check(task, &tool_id);
        self.publish(task, &pre);
        if let Some(reason) = pre.blocking_reason() {
            warn!(task_id = %task.task_id, %tool_id, %reason, "Task blocked by guardrails");
            let mut result = ExecutionResult::not_run(task, ExecutionStatus::Blocked, Some(tool_id), reason);
            result.violations = pre.violations;
            return Ok(result);
        }

        let Some(adapter) = self.adapter_for(&tool_id) else {
            let error = format!("tool {} has no adapter", tool_id);
            warn!(task_id = %task.task_id, %error, "Routed tool is not configured");
            return Ok(ExecutionResult::not_run(task, ExecutionStatus::Failed, Some(tool_id), error));
        };

        let request = ToolRequest {
            run_id: self.run_id.clone(),
            task_id: task.task_id.clone(),
            task_kind: task.task_kind.clone(),
            tool_id: tool_id.clone(),
            command: self.router.config().app(&tool_id).and_then(|a| a.command.clone()),
            cwd: worktree.to_path_buf(),
            timeout: self.router.config().timeout_for(&tool_id),
            metadata: task.metadata.clone(),
        };
        let started_at = now_ms();
        let outcome = adapter.invoke(&request).await;
        self.record_attempt(task, &tool_id, &outcome, worktree, started_at).await?;
        if let Some(emitter) = &self.emitter {
            emitter.tool_completed(&task.task_id, &tool_id, outcome.exit_code, outcome.timed_out, outcome.duration_ms);
        }

        let changes = self.observe_changes(worktree).await;
        let post = self.guardrails.post_check(task, &outcome, changes.as_ref(), worktree);
        self.publish(task, &post);

        let mut violations = pre.violations;
        violations.extend(post.violations.iter().cloned());
        let mut result = ExecutionResult {
            task_id: task.task_id.clone(),
            status: ExecutionStatus::Failed,
            tool_id: Some(tool_id.clone()),
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            duration_ms: outcome.duration_ms,
            output_patch_id: None,
            ledger_id: None,
            error: None,
            violations,
        };

        let success = outcome.success() && !post.is_blocked();
        if let Err(e) = self.router.record_execution_result(&tool_id, success, outcome.duration_ms) {
            warn!(%tool_id, error = %e, "Failed to record tool metrics");
        }

        if let Some(reason) = post.blocking_reason() {
            warn!(task_id = %task.task_id, %reason, "Post-execution guardrails failed");
            result.error = Some(reason);
            self.discard_changes(task, worktree).await;
            return Ok(result);
        }
        if !outcome.success() {
            result.error = Some(failure_message(&outcome));
            info!(task_id = %task.task_id, %tool_id, exit_code = outcome.exit_code, "Task failed");
            self.discard_changes(task, worktree).await;
            return Ok(result);
        }

        result.status = ExecutionStatus::Succeeded;
        let patch_id = self.produce_patch(task, &outcome, changes.as_ref(), worktree).await;
        if let Some(patch_id) = patch_id {
            let ledger_id = self.record_patch(task, &tool_id, &patch_id).await?;
            result.output_patch_id = Some(patch_id);
            result.ledger_id = Some(ledger_id);
        }
        info!(task_id = %task.task_id, %tool_id, patch_id = ?result.output_patch_id, "Task succeeded");
        Ok(result)
    }

    async fn record_attempt(
        &self,
        task: &Task,
        tool_id: &str,
        outcome: &ToolOutcome,
        worktree: &Path,
        started_at: i64,
    ) -> Result<(), StateError> {
        let mut attempt = StepAttempt::new(&self.run_id, &task.task_id, tool_id);
        attempt.exit_code = outcome.exit_code;
        attempt.timed_out = outcome.timed_out;
        attempt.duration_ms = outcome.duration_ms;
        attempt.worktree = Some(worktree.to_string_lossy().to_string());
        attempt.started_at = started_at;
        attempt.finished_at = now_ms();
        self.state.record_attempt(attempt).await?;
        Ok(())
    }

    async fn observe_changes(&self, worktree: &Path) -> Option<ChangeSummary> {
        let worktrees = self.worktrees.as_ref()?;
        match worktrees.stage_and_summarize(worktree).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(?worktree, error = %e, "Could not summarize worktree changes");
                None
            }
        }
    }

    /// Reset the worktree to the last committed patch
    async fn discard_changes(&self, task: &Task, worktree: &Path) {
        let Some(worktrees) = &self.worktrees else {
            return;
        };
        if let Err(e) = worktrees.discard_changes(worktree).await {
            error!(task_id = %task.task_id, ?worktree, error = %e, "Failed to discard changes of unsuccessful task");
        }
    }

    /// The commit of the tool's changes, else whatever patch id the tool reported
    async fn produce_patch(
        &self,
        task: &Task,
        outcome: &ToolOutcome,
        changes: Option<&ChangeSummary>,
        worktree: &Path,
    ) -> Option<String> {
        if let (Some(worktrees), Some(changes)) = (&self.worktrees, changes)
            && !changes.is_empty()
        {
            let message = format!("{}: {} ({})", task.task_id, task.task_kind, self.run_id);
            match worktrees.commit_all(worktree, &message).await {
                Ok(Some(sha)) => return Some(sha),
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.task_id, error = %e, "Failed to commit task changes"),
            }
        }
        ToolReport::from_outcome(outcome).and_then(|r| r.patch_id)
    }

    async fn record_patch(&self, task: &Task, tool_id: &str, patch_id: &str) -> Result<String, StateError> {
        let metadata = vec![
            ("task_id".to_string(), json!(task.task_id)),
            ("tool_id".to_string(), json!(tool_id)),
        ];
        let entry = self
            .ledger
            .create_entry(patch_id, &self.run_id, task.workstream_id(), metadata)
            .await?;
        self.ledger.mark_validated(&entry.ledger_id).await?;
        if self.submit_for_review {
            self.ledger.mark_for_review(&entry.ledger_id).await?;
        }
        Ok(entry.ledger_id)
    }
}

fn failure_message(outcome: &ToolOutcome) -> String {
    if outcome.timed_out {
        return format!("tool timed out after {}ms", outcome.duration_ms);
    }
    let stderr = outcome.stderr.trim();
    let tail: String = stderr.lines().last().unwrap_or("").chars().take(200).collect();
    if tail.is_empty() {
        format!("tool exited with code {}", outcome.exit_code)
    } else {
        format!("tool exited with code {}: {}", outcome.exit_code, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PatchState;
    use crate::executor::{PatternGuardrails, PatternRegistry, ViolationKind};
    use crate::router::{InMemoryStateStore, RouterConfig};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const ROUTER: &str = r#"
apps:
  aider:
    capabilities:
      task_kinds: [code_edit]
    command: "true"
  pytest:
    capabilities:
      task_kinds: [test_run]
    command: "true"
routing:
  rules: []
"#;

    /// Replays scripted outcomes and remembers which tools were invoked
    struct ScriptedAdapter {
        outcomes: Mutex<Vec<ToolOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(outcomes: Vec<ToolOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToolAdapter for ScriptedAdapter {
        fn kind(&self) -> crate::executor::AdapterKind {
            crate::executor::AdapterKind::Noop
        }

        async fn invoke(&self, request: &ToolRequest) -> ToolOutcome {
            self.calls.lock().unwrap().push(request.tool_id.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                ToolOutcome::default()
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn executor(state: &StateManager, adapter: Arc<ScriptedAdapter>) -> Executor {
        let router = TaskRouter::new(
            RouterConfig::from_yaml(ROUTER).unwrap(),
            Box::new(InMemoryStateStore::new()),
        );
        Executor::new("run-1", router, state.clone()).with_adapter(adapter)
    }

    fn reported(line: &str, exit_code: i32) -> ToolOutcome {
        ToolOutcome {
            exit_code,
            stdout: format!("{}\n", line),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_success_with_reported_patch_goes_to_review() {
        let dir = tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();
        let adapter = ScriptedAdapter::new(vec![reported(r#"{"status": "completed", "patch_id": "p-1"}"#, 0)]);
        let mut exec = executor(&state, adapter.clone());

        let task = Task::new("t1", "code_edit").with_meta("workstream_id", "ws-a");
        let result = exec.execute(&task, dir.path()).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.tool_id.as_deref(), Some("aider"));
        assert_eq!(result.output_patch_id.as_deref(), Some("p-1"));
        let entry = state.get_ledger_entry(result.ledger_id.as_deref().unwrap()).await.unwrap().unwrap();
        assert_eq!(entry.state, PatchState::AwaitingReview);
        assert_eq!(entry.workstream_id.as_deref(), Some("ws-a"));

        let attempts = state.list_attempts("run-1").await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].tool_id, "aider");
        assert_eq!(exec.router().metrics("aider").success_count, 1);
    }

    #[tokio::test]
    async fn test_unroutable_task() {
        let dir = tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();
        let adapter = ScriptedAdapter::new(Vec::new());
        let mut exec = executor(&state, adapter.clone());

        let result = exec.execute(&Task::new("t1", "translate"), dir.path()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Unroutable);
        assert_eq!(result.exit_code, EXIT_NOT_RUN);
        assert!(adapter.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hallucinated_success_fails_task() {
        let dir = tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();
        let adapter = ScriptedAdapter::new(vec![reported(r#"{"status": "completed", "patch_id": "p-1"}"#, 1)]);
        let registry = PatternRegistry::default();
        let mut exec = executor(&state, adapter).with_guardrails(Arc::new(PatternGuardrails::new(registry)));

        let result = exec.execute(&Task::new("t1", "code_edit"), dir.path()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.violations.iter().any(|v| v.kind == ViolationKind::HallucinatedSuccess));
        assert!(result.ledger_id.is_none());
        assert_eq!(exec.router().metrics("aider").failure_count, 1);
        assert!(state.list_ledger_entries(None, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_task_never_runs() {
        let dir = tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();
        let adapter = ScriptedAdapter::new(Vec::new());
        let registry = PatternRegistry::default().with_protected_paths(["secrets/**"]);
        let mut exec = executor(&state, adapter.clone()).with_guardrails(Arc::new(PatternGuardrails::new(registry)));

        let task = Task::new("t1", "code_edit").with_meta("files", json!(["secrets/token"]));
        let result = exec.execute(&task, dir.path()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Blocked);
        assert!(result.error.unwrap().contains("protected"));
        assert!(adapter.calls.lock().unwrap().is_empty());
        assert!(state.list_attempts("run-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_tool_reports_stderr() {
        let dir = tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();
        let adapter = ScriptedAdapter::new(vec![ToolOutcome {
            exit_code: 2,
            stderr: "warming up\nsyntax error on line 3\n".to_string(),
            ..Default::default()
        }]);
        let mut exec = executor(&state, adapter);

        let result = exec.execute(&Task::new("t1", "test_run"), dir.path()).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.tool_id.as_deref(), Some("pytest"));
        assert_eq!(result.error.as_deref(), Some("tool exited with code 2: syntax error on line 3"));
    }

    #[tokio::test]
    async fn test_success_without_patch_has_no_ledger_entry() {
        let dir = tempdir().unwrap();
        let state = StateManager::spawn_in_memory().unwrap();
        let mut exec = executor(&state, ScriptedAdapter::new(Vec::new())).with_review(false);

        let result = exec.execute(&Task::new("t1", "code_edit"), dir.path()).await.unwrap();
        assert!(result.succeeded());
        assert!(result.output_patch_id.is_none());
        assert!(result.ledger_id.is_none());
    }
}
