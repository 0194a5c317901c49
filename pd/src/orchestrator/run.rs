//! RunOrchestrator - scheduler -> router -> worktree -> executor -> ledger
//!
//! Single-threaded and cooperative: one task at a time, and nothing moves on
//! until the task's result is recorded.

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{Lifecycle, PatchState, RunRecord, RunState, TaskStatus};
use crate::events::EventEmitter;
use crate::executor::{
    ExecutionStatus, Executor, Gap, LoopDetector, LoopSignal, PatternGuardrails, PatternRegistry, PlanningMitigation,
    Severity, Workstream, mitigate_planning_loop,
};
use crate::router::{FileStateStore, RouterConfig, TaskRouter, ToolProfiles};
use crate::scheduler::TaskGraph;
use crate::state::StateManager;
use crate::worktree::WorktreeManager;

/// Where a run's tools execute
#[derive(Clone)]
pub enum Workspace {
    /// A dedicated git worktree per run
    Worktree(Arc<WorktreeManager>),
    /// A plain directory shared with nothing else (dry runs, tests)
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Attempts per task before it counts as failed
    pub max_attempts: u32,
    /// Remove the run's worktree when every task completed
    pub auto_cleanup: bool,
    /// Archive the worktree before removing it
    pub archive_on_cleanup: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            auto_cleanup: false,
            archive_on_cleanup: false,
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub succeeded: bool,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unroutable: usize,
    pub blocked: usize,
    pub patches: Vec<String>,
    pub fatal_error: Option<String>,
    pub worktree: Option<PathBuf>,
    /// Content hash of the executed task graph
    pub plan_signature: Option<String>,
    /// Set when this plan has repeated without anything getting applied
    pub planning_mitigation: Option<PlanningMitigation>,
}

impl RunSummary {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Default::default()
        }
    }

    fn note_error(&mut self, error: impl Into<String>) {
        if self.fatal_error.is_none() {
            self.fatal_error = Some(error.into());
        }
    }

    fn metadata(&self) -> Vec<(String, Value)> {
        let mut metadata = vec![(
            "summary".to_string(),
            json!({
                "completed": self.completed,
                "failed": self.failed,
                "skipped": self.skipped,
                "unroutable": self.unroutable,
                "blocked": self.blocked,
                "patches": self.patches,
            }),
        )];
        if let Some(error) = &self.fatal_error {
            metadata.push(("error".to_string(), json!(error)));
        }
        if let Some(path) = &self.worktree {
            metadata.push(("worktree".to_string(), json!(path.to_string_lossy())));
        }
        if let Some(signature) = &self.plan_signature {
            metadata.push(("plan_signature".to_string(), json!(signature)));
        }
        if let Some(mitigation) = &self.planning_mitigation {
            metadata.push(("planning_loop".to_string(), json!(mitigation)));
        }
        metadata
    }
}

pub struct RunOrchestrator {
    state: StateManager,
    executor: Executor,
    workspace: Workspace,
    loops: LoopDetector,
    emitter: Option<EventEmitter>,
    options: RunOptions,
}

impl RunOrchestrator {
    pub fn new(state: StateManager, executor: Executor, workspace: Workspace) -> Self {
        debug!("RunOrchestrator::new: called");
        Self {
            state,
            executor,
            workspace,
            loops: LoopDetector::default(),
            emitter: None,
            options: RunOptions::default(),
        }
    }

    /// Wire router, guardrails, worktrees and loop thresholds from `config`
    pub fn from_config(config: &Config, state: StateManager, run_id: &str, emitter: EventEmitter) -> Result<Self> {
        debug!(%run_id, "RunOrchestrator::from_config: called");
        let router_config = RouterConfig::load(&config.router.config_path).context(format!(
            "Failed to load router config from {}",
            config.router.config_path.display()
        ))?;
        let store = FileStateStore::open(&config.router.state_file, config.router.flush_every);
        let mut router = TaskRouter::new(router_config, Box::new(store)).with_feedback(emitter.clone());
        if let Some(path) = &config.router.profiles_path {
            let profiles = ToolProfiles::load(path).context(format!("Failed to load tool profiles from {}", path.display()))?;
            router = router.with_profiles(profiles);
        }

        let worktrees = Arc::new(WorktreeManager::new(config.worktree.to_worktree_config()));
        let mut executor = Executor::new(run_id, router, state.clone())
            .with_worktrees(worktrees.clone())
            .with_emitter(emitter.clone());
        // Protected paths and report cross-checks apply even without a patterns file
        let registry = match &config.guardrails.patterns_file {
            Some(path) => {
                PatternRegistry::load(path).context(format!("Failed to load guardrail patterns from {}", path.display()))?
            }
            None => PatternRegistry::default(),
        };
        let registry = registry.with_protected_paths(config.guardrails.protected_paths.iter().cloned());
        executor = executor.with_guardrails(Arc::new(PatternGuardrails::new(registry)));

        let loops = LoopDetector::new(
            config.guardrails.planning_loop_threshold,
            config.guardrails.execution_loop_threshold,
        );
        Ok(Self::new(state, executor, Workspace::Worktree(worktrees))
            .with_loop_detector(loops)
            .with_emitter(emitter)
            .with_options(RunOptions {
                auto_cleanup: config.daemon.auto_cleanup_completed,
                ..Default::default()
            }))
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_loop_detector(mut self, loops: LoopDetector) -> Self {
        self.loops = loops;
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    pub fn loop_detector(&self) -> &LoopDetector {
        &self.loops
    }

    /// Drive `graph` to completion for `run_id` and persist the final state
    pub async fn run(&mut self, run_id: &str, mut graph: TaskGraph) -> Result<RunSummary> {
        info!(%run_id, tasks = graph.len(), "Starting run");
        let mut summary = RunSummary::new(run_id);
        self.start_run(run_id).await?;

        // Graph problems are fatal before anything executes
        let mut frontier = match graph.frontier() {
            Ok(frontier) => frontier,
            Err(e) => {
                error!(%run_id, error = %e, "Task graph is invalid");
                summary.note_error(format!("invalid task graph: {}", e));
                return self.finish(run_id, summary).await;
            }
        };

        let signature = graph.signature();
        summary.planning_mitigation = self.check_planning_loop(run_id, &signature, &graph).await?;
        summary.plan_signature = Some(signature);

        let workdir = match self.prepare_workspace(run_id).await {
            Ok(path) => path,
            Err(e) => {
                error!(%run_id, error = %e, "Failed to prepare workspace");
                summary.note_error(format!("failed to prepare workspace: {}", e));
                return self.finish(run_id, summary).await;
            }
        };
        summary.worktree = Some(workdir.clone());

        while let Some(task_id) = frontier.next_ready() {
            self.set_task_status(&mut graph, &task_id, TaskStatus::Ready);
            let status = self.run_task(&mut graph, &task_id, &workdir, &mut summary).await?;
            if status == TaskStatus::Completed {
                frontier.complete(&task_id);
                continue;
            }
            for dependent in frontier.block(&task_id) {
                debug!(%task_id, %dependent, "RunOrchestrator::run: skipping dependent");
                self.set_task_status(&mut graph, &dependent, TaskStatus::Skipped);
                summary.skipped += 1;
            }
        }

        // Anything left never became ready
        let leftovers: Vec<String> = graph
            .tasks()
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.task_id.clone())
            .collect();
        for task_id in leftovers {
            warn!(%task_id, "Task never became ready");
            self.set_task_status(&mut graph, &task_id, TaskStatus::Skipped);
            summary.skipped += 1;
        }

        if let Err(e) = self.executor.router_mut().flush() {
            warn!(error = %e, "Failed to flush router state");
        }

        summary.succeeded = summary.fatal_error.is_none() && summary.completed == graph.len();
        if summary.succeeded && self.options.auto_cleanup {
            self.cleanup_workspace(&workdir).await;
        }
        self.finish(run_id, summary).await
    }

    async fn start_run(&self, run_id: &str) -> Result<()> {
        let run = self
            .state
            .get_run(run_id)
            .await
            .context("Failed to load run")?
            .ok_or_else(|| eyre::eyre!("Run {} not found", run_id))?;
        match run.state {
            RunState::Pending => {
                self.state
                    .transition_run(run_id, RunState::Running, Vec::new())
                    .await
                    .context("Failed to start run")?;
                if let Some(emitter) = &self.emitter {
                    emitter.run_state_changed(RunState::Pending, RunState::Running);
                }
                Ok(())
            }
            // Claimed by the daemon before it spawned us
            RunState::Running => Ok(()),
            state => Err(eyre::eyre!("Run {} already finished ({})", run_id, state)),
        }
    }

    /// Count earlier runs of this project/phase that executed the same plan and
    /// got nothing applied; at the threshold, record a reduced plan
    ///
    /// The current graph still executes; the mitigation is persisted for the planner.
    async fn check_planning_loop(
        &mut self,
        run_id: &str,
        signature: &str,
        graph: &TaskGraph,
    ) -> Result<Option<PlanningMitigation>> {
        debug!(%run_id, %signature, "RunOrchestrator::check_planning_loop: called");
        let current = self
            .state
            .get_run(run_id)
            .await
            .context("Failed to load run")?
            .ok_or_else(|| eyre::eyre!("Run {} not found", run_id))?;

        let mut previous: Vec<RunRecord> = self
            .state
            .list_runs(None)
            .await
            .context("Failed to list runs")?
            .into_iter()
            .filter(|r| {
                r.run_id != run_id
                    && r.state.is_terminal()
                    && r.project_id == current.project_id
                    && r.phase_id == current.phase_id
                    && r.meta_str("plan_signature") == Some(signature)
            })
            .collect();
        previous.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut repeats = 0u32;
        for run in &previous {
            let applied = self
                .state
                .list_ledger_entries(Some(PatchState::Applied), Some(run.run_id.clone()), None)
                .await
                .context("Failed to list applied patches")?;
            if !applied.is_empty() {
                break;
            }
            repeats += 1;
        }
        self.loops.restore_planning_repeats(signature, repeats);

        let Some(LoopSignal::Planning { count, .. }) = self.loops.record_planning_attempt(signature, 0) else {
            return Ok(None);
        };
        if let Some(emitter) = &self.emitter {
            emitter.loop_detected("planning", None, count);
        }
        let (workstreams, gaps) = plan_outline(graph);
        Ok(Some(mitigate_planning_loop(workstreams, gaps)))
    }

    async fn prepare_workspace(&self, run_id: &str) -> Result<PathBuf> {
        match &self.workspace {
            Workspace::Worktree(manager) => Ok(manager.create(run_id, None, None, None).await?),
            Workspace::Directory(path) => {
                tokio::fs::create_dir_all(path).await?;
                Ok(path.clone())
            }
        }
    }

    async fn cleanup_workspace(&self, workdir: &std::path::Path) {
        if let Workspace::Worktree(manager) = &self.workspace {
            match manager.cleanup(workdir, self.options.archive_on_cleanup, false).await {
                Ok(true) => info!(?workdir, "Cleaned up run worktree"),
                Ok(false) => warn!(?workdir, "Run worktree kept"),
                Err(e) => warn!(?workdir, error = %e, "Run worktree cleanup failed"),
            }
        }
    }

    /// Execute one ready task, retrying up to `max_attempts`; returns its final status
    async fn run_task(
        &mut self,
        graph: &mut TaskGraph,
        task_id: &str,
        workdir: &std::path::Path,
        summary: &mut RunSummary,
    ) -> Result<TaskStatus> {
        let max_attempts = self.options.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            self.set_task_status(graph, task_id, TaskStatus::Running);
            let Some(task) = graph.get(task_id).cloned() else {
                return Err(eyre::eyre!("Task {} vanished from graph", task_id));
            };
            debug!(%task_id, attempt, "RunOrchestrator::run_task: executing");

            let result = self
                .executor
                .execute(&task, workdir)
                .await
                .context(format!("Failed to record execution of {}", task_id))?;

            let error = result
                .error
                .clone()
                .unwrap_or_else(|| format!("exit code {}", result.exit_code));
            match result.status {
                ExecutionStatus::Succeeded => {
                    self.loops.record_execution_success(task_id);
                    if let Some(patch) = result.output_patch_id {
                        summary.patches.push(patch);
                    }
                    summary.completed += 1;
                    self.set_task_status(graph, task_id, TaskStatus::Completed);
                    return Ok(TaskStatus::Completed);
                }
                ExecutionStatus::Unroutable => {
                    summary.unroutable += 1;
                    summary.note_error(format!("task {} is unroutable: {}", task_id, error));
                    self.set_task_status(graph, task_id, TaskStatus::Failed);
                    return Ok(TaskStatus::Failed);
                }
                ExecutionStatus::Blocked => {
                    summary.blocked += 1;
                    summary.note_error(format!("task {} blocked by guardrails: {}", task_id, error));
                    self.set_task_status(graph, task_id, TaskStatus::Failed);
                    return Ok(TaskStatus::Failed);
                }
                ExecutionStatus::Failed => {
                    if let Some(LoopSignal::Execution { count, .. }) = self.loops.record_execution_failure(task_id) {
                        if let Some(emitter) = &self.emitter {
                            emitter.loop_detected("execution", Some(task_id), count);
                        }
                        summary.skipped += 1;
                        summary.note_error(format!("task {} skipped after {} failed attempts: {}", task_id, count, error));
                        self.set_task_status(graph, task_id, TaskStatus::Skipped);
                        return Ok(TaskStatus::Skipped);
                    }
                    if attempt < max_attempts {
                        info!(%task_id, attempt, max_attempts, "Retrying failed task");
                        self.set_task_status(graph, task_id, TaskStatus::Ready);
                        continue;
                    }
                    summary.failed += 1;
                    summary.note_error(format!("task {} failed: {}", task_id, error));
                    self.set_task_status(graph, task_id, TaskStatus::Failed);
                    return Ok(TaskStatus::Failed);
                }
            }
        }
        Ok(TaskStatus::Failed)
    }

    fn set_task_status(&self, graph: &mut TaskGraph, task_id: &str, target: TaskStatus) {
        let from = graph.get(task_id).map(|t| t.status);
        match graph.transition(task_id, target) {
            Ok(()) => {
                if let (Some(emitter), Some(from)) = (&self.emitter, from) {
                    emitter.task_state_changed(task_id, from, target);
                }
            }
            Err(e) => warn!(%task_id, error = %e, "Task transition rejected"),
        }
    }

    async fn finish(&self, run_id: &str, summary: RunSummary) -> Result<RunSummary> {
        let target = if summary.succeeded {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        self.state
            .transition_run(run_id, target, summary.metadata())
            .await
            .context("Failed to record run result")?;
        if let Some(emitter) = &self.emitter {
            emitter.run_state_changed(RunState::Running, target);
            if let Some(error) = &summary.fatal_error {
                emitter.error("run", error);
            }
        }
        info!(
            %run_id,
            state = %target,
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            unroutable = summary.unroutable,
            blocked = summary.blocked,
            "Run finished"
        );
        Ok(summary)
    }
}

/// Workstreams and gaps named by task metadata, deduplicated
fn plan_outline(graph: &TaskGraph) -> (Vec<Workstream>, Vec<Gap>) {
    let mut workstreams: Vec<Workstream> = Vec::new();
    let mut gaps: Vec<Gap> = Vec::new();
    for task in graph.tasks() {
        if let Some(id) = task.workstream_id()
            && !workstreams.iter().any(|w| w.workstream_id == id)
        {
            let priority = task
                .metadata
                .get("priority")
                .and_then(Value::as_u64)
                .map_or(u32::MAX, |p| u32::try_from(p).unwrap_or(u32::MAX));
            workstreams.push(Workstream {
                workstream_id: id.to_string(),
                priority,
            });
        }
        if let Some(id) = task.metadata.get("gap_id").and_then(Value::as_str)
            && !gaps.iter().any(|g| g.gap_id == id)
        {
            let severity = task
                .metadata
                .get("gap_severity")
                .and_then(|v| serde_json::from_value::<Severity>(v.clone()).ok())
                .unwrap_or(Severity::Warning);
            gaps.push(Gap {
                gap_id: id.to_string(),
                severity,
            });
        }
    }
    (workstreams, gaps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PatchLedgerEntry, Task};
    use crate::executor::{ToolAdapter, ToolOutcome, ToolRequest};
    use crate::router::InMemoryStateStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const ROUTER: &str = r#"
apps:
  editor:
    capabilities:
      task_kinds: [code_edit, test_run]
"#;

    /// Exit code per task id (default 0), and the order tasks ran in
    #[derive(Default)]
    struct FakeAdapter {
        exit_codes: HashMap<String, i32>,
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolAdapter for FakeAdapter {
        fn kind(&self) -> crate::executor::AdapterKind {
            crate::executor::AdapterKind::Noop
        }

        async fn invoke(&self, request: &ToolRequest) -> ToolOutcome {
            self.ran.lock().unwrap().push(request.task_id.clone());
            ToolOutcome {
                exit_code: self.exit_codes.get(&request.task_id).copied().unwrap_or(0),
                stdout: format!("{{\"patch_id\": \"patch-{}\"}}", request.task_id),
                ..Default::default()
            }
        }
    }

    async fn setup(adapter: Arc<FakeAdapter>, dir: &std::path::Path) -> (StateManager, RunOrchestrator) {
        let state = StateManager::spawn_in_memory().unwrap();
        state.create_run(RunRecord::with_id("run-1", "proj", "phase")).await.unwrap();
        let router = TaskRouter::new(RouterConfig::from_yaml(ROUTER).unwrap(), Box::new(InMemoryStateStore::new()));
        let executor = Executor::new("run-1", router, state.clone()).with_adapter(adapter);
        let orchestrator = RunOrchestrator::new(state.clone(), executor, Workspace::Directory(dir.to_path_buf()));
        (state, orchestrator)
    }

    fn graph(edges: &[(&str, &[&str])]) -> TaskGraph {
        let mut graph = TaskGraph::new();
        for (id, deps) in edges {
            graph.add_task(Task::new(*id, "code_edit").with_deps(deps.iter().copied())).unwrap();
        }
        graph
    }

    #[tokio::test]
    async fn test_all_tasks_complete_in_dependency_order() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter::default());
        let (state, mut orchestrator) = setup(adapter.clone(), dir.path()).await;

        let summary = orchestrator
            .run("run-1", graph(&[("A", &[]), ("B", &["A"]), ("C", &["A"]), ("D", &["B", "C"])]))
            .await
            .unwrap();

        assert!(summary.succeeded);
        assert_eq!(summary.completed, 4);
        assert_eq!(summary.patches.len(), 4);
        assert_eq!(*adapter.ran.lock().unwrap(), vec!["A", "B", "C", "D"]);

        let run = state.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.metadata["summary"]["completed"], 4);
        assert_eq!(state.list_ledger_entries(None, Some("run-1".into()), None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_failed_task_skips_dependents() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter {
            exit_codes: HashMap::from([("B".to_string(), 1)]),
            ..Default::default()
        });
        let (state, mut orchestrator) = setup(adapter.clone(), dir.path()).await;

        let summary = orchestrator
            .run("run-1", graph(&[("A", &[]), ("B", &["A"]), ("C", &["B"]), ("D", &["A"])]))
            .await
            .unwrap();

        assert!(!summary.succeeded);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!adapter.ran.lock().unwrap().contains(&"C".to_string()));

        let run = state.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.meta_str("error").unwrap().starts_with("task B failed"));
    }

    #[tokio::test]
    async fn test_missing_dependency_is_fatal_before_execution() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter::default());
        let (state, mut orchestrator) = setup(adapter.clone(), dir.path()).await;

        let summary = orchestrator
            .run("run-1", graph(&[("B", &["A"]), ("C", &["A"])]))
            .await
            .unwrap();

        assert!(!summary.succeeded);
        assert!(adapter.ran.lock().unwrap().is_empty());
        let run = state.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert!(run.meta_str("error").unwrap().contains("invalid task graph"));
    }

    #[tokio::test]
    async fn test_cycle_is_fatal() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter::default());
        let (_state, mut orchestrator) = setup(adapter.clone(), dir.path()).await;

        let summary = orchestrator
            .run("run-1", graph(&[("A", &["B"]), ("B", &["A"])]))
            .await
            .unwrap();
        assert!(summary.fatal_error.unwrap().contains("invalid task graph"));
        assert!(adapter.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_failures_trigger_execution_loop() {
        let dir = tempdir().unwrap();
        let adapter = Arc::new(FakeAdapter {
            exit_codes: HashMap::from([("A".to_string(), 1)]),
            ..Default::default()
        });
        let (_state, orchestrator) = setup(adapter.clone(), dir.path()).await;
        let mut orchestrator = orchestrator
            .with_options(RunOptions {
                max_attempts: 5,
                ..Default::default()
            })
            .with_loop_detector(LoopDetector::new(3, 3));

        let summary = orchestrator.run("run-1", graph(&[("A", &[]), ("B", &["A"])])).await.unwrap();

        assert_eq!(adapter.ran.lock().unwrap().len(), 3);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 0);
        assert!(orchestrator.loop_detector().is_skipped("A"));
        assert!(summary.fatal_error.unwrap().contains("skipped after 3 failed attempts"));
    }

    async fn prior_run(state: &StateManager, run_id: &str, created_at: i64, signature: &str) {
        let mut run = RunRecord::with_id(run_id, "proj", "phase");
        run.state = RunState::Failed;
        run.created_at = created_at;
        run.set_meta("plan_signature", signature);
        state.create_run(run).await.unwrap();
    }

    fn outlined_graph() -> TaskGraph {
        let mut graph = TaskGraph::new();
        for (id, ws, priority, gap, severity) in [
            ("A", "ws-1", 1, "gap-1", "critical"),
            ("B", "ws-2", 2, "gap-2", "warning"),
            ("C", "ws-3", 3, "gap-3", "critical"),
        ] {
            graph
                .add_task(
                    Task::new(id, "code_edit")
                        .with_meta("workstream_id", ws)
                        .with_meta("priority", priority)
                        .with_meta("gap_id", gap)
                        .with_meta("gap_severity", severity),
                )
                .unwrap();
        }
        graph
    }

    #[tokio::test]
    async fn test_repeated_plan_without_applied_patches_is_a_planning_loop() {
        let dir = tempdir().unwrap();
        let (state, orchestrator) = setup(Arc::new(FakeAdapter::default()), dir.path()).await;
        let mut orchestrator = orchestrator.with_loop_detector(LoopDetector::new(3, 3));
        let signature = outlined_graph().signature();
        prior_run(&state, "run-0a", 1, &signature).await;
        prior_run(&state, "run-0b", 2, &signature).await;
        // Different phase; never counted
        let mut other = RunRecord::with_id("run-other", "proj", "other-phase");
        other.state = RunState::Failed;
        other.set_meta("plan_signature", signature.as_str());
        state.create_run(other).await.unwrap();

        let summary = orchestrator.run("run-1", outlined_graph()).await.unwrap();

        let mitigation = summary.planning_mitigation.clone().unwrap();
        assert_eq!(mitigation.workstreams.len(), 2);
        assert_eq!(mitigation.workstreams[0].workstream_id, "ws-1");
        assert_eq!(mitigation.dropped_workstreams, 1);
        assert_eq!(mitigation.gaps.len(), 2);
        assert_eq!(mitigation.dropped_gaps, 1);
        assert_eq!(orchestrator.loop_detector().loops_detected(), 1);
        // The plan itself still ran
        assert_eq!(summary.completed, 3);

        let run = state.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.meta_str("plan_signature"), Some(signature.as_str()));
        assert_eq!(run.metadata["planning_loop"]["dropped_workstreams"], 1);
    }

    #[tokio::test]
    async fn test_applied_patch_breaks_the_planning_streak() {
        let dir = tempdir().unwrap();
        let (state, orchestrator) = setup(Arc::new(FakeAdapter::default()), dir.path()).await;
        let mut orchestrator = orchestrator.with_loop_detector(LoopDetector::new(3, 3));
        let signature = outlined_graph().signature();
        prior_run(&state, "run-0a", 1, &signature).await;
        prior_run(&state, "run-0b", 2, &signature).await;
        let mut applied = PatchLedgerEntry::new("patch-x", "run-0b", None);
        applied.state = PatchState::Applied;
        state.create_ledger_entry(applied).await.unwrap();

        let summary = orchestrator.run("run-1", outlined_graph()).await.unwrap();

        assert!(summary.planning_mitigation.is_none());
        assert_eq!(orchestrator.loop_detector().loops_detected(), 0);
        let run = state.get_run("run-1").await.unwrap().unwrap();
        assert!(run.metadata.get("planning_loop").is_none());
    }

    #[tokio::test]
    async fn test_finished_run_is_refused() {
        let dir = tempdir().unwrap();
        let (state, mut orchestrator) = setup(Arc::new(FakeAdapter::default()), dir.path()).await;
        state.transition_run("run-1", RunState::Failed, Vec::new()).await.unwrap();
        assert!(orchestrator.run("run-1", graph(&[("A", &[])])).await.is_err());
        assert!(orchestrator.run("missing", graph(&[("A", &[])])).await.is_err());
    }
}
