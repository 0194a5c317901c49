//! Integration tests for PatchDaemon
//!
//! These tests drive whole runs: graph -> route -> execute -> ledger, against
//! real git repositories and real child processes.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use patchdaemon::config::{Config, DaemonConfig};
use patchdaemon::daemon::{DaemonOrchestrator, OsProcessSpawner};
use patchdaemon::domain::{PatchState, RunRecord, RunState, Task, TaskGraphDocument, TaskStatus};
use patchdaemon::events::{create_event_bus, spawn_event_recorder};
use patchdaemon::executor::{Executor, PatternGuardrails, PatternRegistry};
use patchdaemon::ledger::PatchLedger;
use patchdaemon::orchestrator::{RunOrchestrator, Workspace};
use patchdaemon::router::{InMemoryStateStore, RouterConfig, TaskRouter};
use patchdaemon::scheduler::TaskGraph;
use patchdaemon::state::StateManager;
use patchdaemon::worktree::WorktreeManager;
use tempfile::TempDir;

fn setup_git_repo(dir: &Path) {
    for args in [
        vec!["init"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
        vec!["commit", "--allow-empty", "-m", "initial"],
    ] {
        let status = Command::new("git").args(args).current_dir(dir).output().expect("git failed");
        assert!(status.status.success());
    }
}

const ROUTER: &str = r#"
apps:
  editor:
    capabilities:
      task_kinds: [code_edit]
    command: "printf 'edited by {{task_id}}\n' > {{task_id}}.txt"
  tester:
    capabilities:
      task_kinds: [test_run]
    command: "test -f A.txt"
routing:
  rules:
    - id: edits
      match:
        task_kind: code_edit
      select_from: [editor]
      strategy: round_robin
"#;

fn graph_document() -> TaskGraphDocument {
    TaskGraphDocument::from_json(
        r#"{"tasks": [
            {"task_id": "A", "task_kind": "code_edit", "metadata": {"workstream_id": "ws-1"}},
            {"task_id": "B", "task_kind": "code_edit", "depends_on": ["A"]},
            {"task_id": "C", "task_kind": "test_run", "depends_on": ["A"]}
        ]}"#,
    )
    .expect("Failed to parse graph")
}

fn config_for(repo: &Path, work: &Path) -> Config {
    let router_path = work.join("router.yml");
    std::fs::write(&router_path, ROUTER).expect("Failed to write router config");

    let mut config = Config::default();
    config.worktree.repo_root = repo.to_path_buf();
    config.router.config_path = router_path;
    config.router.state_file = work.join("router_state.json");
    config.storage.store_dir = work.join("store");
    config
}

// =============================================================================
// Run Orchestrator
// =============================================================================

#[tokio::test]
async fn test_run_end_to_end_in_worktree() {
    let repo = TempDir::new().expect("Failed to create temp dir");
    let work = TempDir::new().expect("Failed to create temp dir");
    setup_git_repo(repo.path());
    let config = config_for(repo.path(), work.path());

    let state = StateManager::spawn(&config.storage.store_dir).expect("Failed to spawn state");
    state.create_run(RunRecord::with_id("run-e2e", "proj", "phase-1")).await.unwrap();

    let bus = create_event_bus();
    let recorder = spawn_event_recorder(&bus, state.clone());
    let mut orchestrator =
        RunOrchestrator::from_config(&config, state.clone(), "run-e2e", bus.emitter_for("run-e2e")).unwrap();

    let graph = TaskGraph::from_document(graph_document()).unwrap();
    let summary = orchestrator.run("run-e2e", graph).await.unwrap();
    let written = recorder.finish().await;

    assert!(summary.succeeded, "run failed: {:?}", summary.fatal_error);
    assert_eq!(summary.completed, 3);
    // The test task changes nothing, so only the two edits produce patches
    assert_eq!(summary.patches.len(), 2);

    let worktree = summary.worktree.clone().expect("no worktree");
    assert!(worktree.starts_with(repo.path().join(".worktrees")));
    assert_eq!(std::fs::read_to_string(worktree.join("A.txt")).unwrap(), "edited by A\n");
    assert!(!repo.path().join("A.txt").exists(), "main checkout must stay untouched");

    let run = state.get_run("run-e2e").await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(state.list_attempts("run-e2e").await.unwrap().len(), 3);
    assert!(config.router.state_file.exists(), "router state flushed at end of run");

    let events = state.list_events(Some("run-e2e".to_string())).await.unwrap();
    assert_eq!(events.len(), written);
    assert!(events.iter().any(|e| e.kind == "routing_decision"));
    assert!(events.iter().any(|e| e.kind == "patch_state_changed"));

    // Review gate
    let ledger = PatchLedger::new(state.clone());
    let waiting = ledger.list_awaiting_review(Some("run-e2e"), None).await.unwrap();
    assert_eq!(waiting.len(), 2);
    let from_ws = ledger.list_awaiting_review(None, Some("ws-1")).await.unwrap();
    assert_eq!(from_ws.len(), 1);

    let approved = &from_ws[0].ledger_id;
    assert!(ledger.approve_patch(approved, "alice", Some("lgtm")).await.unwrap());
    assert!(!ledger.approve_patch(approved, "bob", None).await.unwrap());
    let worktrees = WorktreeManager::new(config.worktree.to_worktree_config());
    assert!(ledger.apply_patch(approved, &worktrees, Some("merger")).await.unwrap());
    assert_eq!(std::fs::read_to_string(repo.path().join("A.txt")).unwrap(), "edited by A\n");
    assert!(!repo.path().join("B.txt").exists(), "only the approved patch lands");

    let rejected = waiting.iter().find(|e| &e.ledger_id != approved).unwrap();
    assert!(ledger.reject_patch(&rejected.ledger_id, "alice", "not needed").await.unwrap());
    assert!(!ledger.mark_applied(&rejected.ledger_id, None).await.unwrap());

    let applied = ledger.get(approved).await.unwrap().unwrap();
    assert_eq!(applied.state, PatchState::Applied);
    let history = applied.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history[2].actor.as_deref(), Some("alice"));
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().expect("git failed");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Run `tasks` through `from_config` in a fresh repo; returns the repo so the worktree outlives the call
async fn worktree_run(
    router_yaml: &str,
    patterns: Option<&str>,
    tasks: Vec<Task>,
) -> (TempDir, TempDir, StateManager, patchdaemon::RunSummary) {
    let repo = TempDir::new().expect("Failed to create temp dir");
    let work = TempDir::new().expect("Failed to create temp dir");
    setup_git_repo(repo.path());
    let mut config = config_for(repo.path(), work.path());
    std::fs::write(&config.router.config_path, router_yaml).unwrap();
    if let Some(patterns) = patterns {
        let path = work.path().join("patterns.yml");
        std::fs::write(&path, patterns).unwrap();
        config.guardrails.patterns_file = Some(path);
    }

    let state = StateManager::spawn_in_memory().unwrap();
    state.create_run(RunRecord::with_id("run-wt", "proj", "phase")).await.unwrap();
    let bus = create_event_bus();
    let mut orchestrator =
        RunOrchestrator::from_config(&config, state.clone(), "run-wt", bus.emitter_for("run-wt")).unwrap();

    let mut graph = TaskGraph::new();
    for task in tasks {
        graph.add_task(task).unwrap();
    }
    let summary = orchestrator.run("run-wt", graph).await.unwrap();
    (repo, work, state, summary)
}

const MIXED_ROUTER: &str = r#"
apps:
  flaky:
    capabilities:
      task_kinds: [flaky]
    command: "echo junk > leaked.txt; exit 1"
  liar:
    capabilities:
      task_kinds: [lie]
    command: |-
      echo evil > evil.txt; echo '{"status": "completed", "tests_run": 3, "tests_passed": 1}'
  editor:
    capabilities:
      task_kinds: [code_edit]
    command: "printf 'edited by {{task_id}}\n' > {{task_id}}.txt"
"#;

#[tokio::test]
async fn test_unsuccessful_tasks_leave_nothing_for_the_next_commit() {
    // No patterns file: the report cross-check still applies
    let (_repo, _work, state, summary) = worktree_run(
        MIXED_ROUTER,
        None,
        vec![Task::new("A", "flaky"), Task::new("L", "lie"), Task::new("B", "code_edit")],
    )
    .await;

    assert_eq!(summary.failed, 2, "{:?}", summary.fatal_error);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.patches.len(), 1);

    let worktree = summary.worktree.clone().expect("no worktree");
    let files = git_stdout(&worktree, &["show", "--name-only", "--format=", summary.patches[0].as_str()]);
    assert_eq!(files, "B.txt");
    assert!(!worktree.join("leaked.txt").exists());
    assert!(!worktree.join("evil.txt").exists());
    assert!(git_stdout(&worktree, &["status", "--porcelain"]).is_empty());

    let entries = state.list_ledger_entries(None, Some("run-wt".to_string()), None).await.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_undeclared_writes_are_caught_after_the_tool_runs() {
    let router = r#"
apps:
  sneaky:
    capabilities:
      task_kinds: [code_edit]
    command: "mkdir -p src secrets && echo fn > src/a.rs && echo key > secrets/key.pem"
"#;
    let patterns = r#"
protected_paths: ["secrets/**"]
patterns:
  edit:
    include: ["src/**"]
"#;
    let (_repo, _work, state, summary) = worktree_run(
        router,
        Some(patterns),
        vec![
            Task::new("A", "code_edit")
                .with_meta("pattern_id", "edit")
                .with_meta("files", serde_json::json!(["src/a.rs"])),
        ],
    )
    .await;

    assert!(!summary.succeeded);
    assert_eq!(summary.failed, 1);
    assert!(summary.patches.is_empty());
    assert!(summary.fatal_error.unwrap().contains("secrets/key.pem"));

    let worktree = summary.worktree.expect("no worktree");
    assert!(!worktree.join("secrets").exists());
    assert!(!worktree.join("src/a.rs").exists());
    assert!(state.list_ledger_entries(None, None, None).await.unwrap().is_empty());
}

async fn directory_run(router_yaml: &str, guardrails: Option<&str>, tasks: Vec<Task>) -> (StateManager, patchdaemon::RunSummary) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let state = StateManager::spawn_in_memory().unwrap();
    state.create_run(RunRecord::with_id("run-1", "proj", "phase")).await.unwrap();

    let router = TaskRouter::new(RouterConfig::from_yaml(router_yaml).unwrap(), Box::new(InMemoryStateStore::new()));
    let mut executor = Executor::new("run-1", router, state.clone());
    if let Some(patterns) = guardrails {
        executor = executor.with_guardrails(Arc::new(PatternGuardrails::new(
            PatternRegistry::from_yaml(patterns).unwrap(),
        )));
    }

    let mut graph = TaskGraph::new();
    for task in tasks {
        graph.add_task(task).unwrap();
    }
    let mut orchestrator = RunOrchestrator::new(state.clone(), executor, Workspace::Directory(dir.path().to_path_buf()));
    let summary = orchestrator.run("run-1", graph).await.unwrap();
    (state, summary)
}

const NOOP_ROUTER: &str = r#"
apps:
  dry:
    adapter: noop
    capabilities:
      task_kinds: [code_edit]
"#;

#[tokio::test]
async fn test_unroutable_task_fails_run_and_skips_dependents() {
    let (state, summary) = directory_run(
        NOOP_ROUTER,
        None,
        vec![
            Task::new("A", "code_edit"),
            Task::new("B", "deploy").with_deps(["A"]),
            Task::new("C", "code_edit").with_deps(["B"]),
            Task::new("D", "code_edit").with_deps(["C"]),
        ],
    )
    .await;

    assert!(!summary.succeeded);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.unroutable, 1);
    assert_eq!(summary.skipped, 2);

    let run = state.get_run("run-1").await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert!(run.meta_str("error").unwrap().contains("unroutable"));
    assert_eq!(run.metadata["summary"]["skipped"], 2);
}

#[tokio::test]
async fn test_protected_path_blocks_task_before_tool_runs() {
    let patterns = r#"
protected_paths: [".git/**"]
patterns:
  edit:
    include: ["**"]
"#;
    let (state, summary) = directory_run(
        NOOP_ROUTER,
        Some(patterns),
        vec![
            Task::new("A", "code_edit")
                .with_meta("pattern_id", "edit")
                .with_meta("files", serde_json::json!([".git/config"])),
            Task::new("B", "code_edit"),
        ],
    )
    .await;

    assert_eq!(summary.blocked, 1);
    assert_eq!(summary.completed, 1);
    // Blocked tasks never reach a tool
    let attempts = state.list_attempts("run-1").await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].task_id, "B");
}

#[tokio::test]
async fn test_invalid_graph_is_fatal() {
    let (state, summary) = directory_run(
        NOOP_ROUTER,
        None,
        vec![
            Task::new("A", "code_edit").with_deps(["C"]),
            Task::new("B", "code_edit").with_deps(["A"]),
            Task::new("C", "code_edit").with_deps(["B"]),
        ],
    )
    .await;

    assert!(!summary.succeeded);
    assert_eq!(summary.completed, 0);
    assert!(state.list_attempts("run-1").await.unwrap().is_empty());
    let run = state.get_run("run-1").await.unwrap().unwrap();
    assert!(run.meta_str("error").unwrap().contains("invalid task graph"));
}

#[test]
fn test_graph_status_after_document_load() {
    let graph = TaskGraph::from_document(graph_document()).unwrap();
    assert_eq!(graph.topological_order().unwrap()[0], "A");
    assert!(graph.tasks().iter().all(|t| t.status == TaskStatus::Pending));
}

// =============================================================================
// Daemon Orchestrator
// =============================================================================

fn daemon_config(log_dir: &Path, max_concurrent_runs: usize) -> DaemonConfig {
    DaemonConfig {
        max_concurrent_runs,
        poll_interval_seconds: 1,
        log_dir: log_dir.to_path_buf(),
        ..Default::default()
    }
}

async fn wait_for_exits(daemon: &mut DaemonOrchestrator) {
    for _ in 0..100 {
        daemon.check_running_processes().await.unwrap();
        if daemon.tracked_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run processes did not exit");
}

#[tokio::test]
async fn test_daemon_supervises_real_processes() {
    let logs = TempDir::new().expect("Failed to create temp dir");
    let state = StateManager::spawn_in_memory().unwrap();
    state.create_run(RunRecord::with_id("run-ok", "p", "ph")).await.unwrap();

    // `sh -c <script> sh <run_id>`: the run id lands in $1
    let spawner = OsProcessSpawner::new(vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo running $1; exit 0".to_string(),
        "sh".to_string(),
    ]);
    let mut daemon = DaemonOrchestrator::new(daemon_config(logs.path(), 2), state.clone(), Box::new(spawner));

    let started = daemon.poll_and_start_runs().await.unwrap();
    assert_eq!(started, vec!["run-ok".to_string()]);
    wait_for_exits(&mut daemon).await;

    let run = state.get_run("run-ok").await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    let stdout = std::fs::read_to_string(logs.path().join("run-ok.stdout.log")).unwrap();
    assert_eq!(stdout.trim(), "running run-ok");
    assert_eq!(daemon.get_status().succeeded, 1);
}

#[tokio::test]
async fn test_daemon_writes_back_failed_runs() {
    let logs = TempDir::new().expect("Failed to create temp dir");
    let state = StateManager::spawn_in_memory().unwrap();
    state.create_run(RunRecord::with_id("run-bad", "p", "ph")).await.unwrap();

    let spawner = OsProcessSpawner::new(vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()]);
    let mut daemon = DaemonOrchestrator::new(daemon_config(logs.path(), 1), state.clone(), Box::new(spawner));

    daemon.poll_and_start_runs().await.unwrap();
    wait_for_exits(&mut daemon).await;

    let run = state.get_run("run-bad").await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.metadata["exit_code"], 3);
    assert!(run.meta_str("error").is_some());
}

#[tokio::test]
async fn test_daemon_stops_long_running_process() {
    let logs = TempDir::new().expect("Failed to create temp dir");
    let state = StateManager::spawn_in_memory().unwrap();
    state.create_run(RunRecord::with_id("run-slow", "p", "ph")).await.unwrap();

    let spawner = OsProcessSpawner::new(vec![
        "sh".to_string(),
        "-c".to_string(),
        "sleep 30".to_string(),
        "sh".to_string(),
    ]);
    let mut daemon = DaemonOrchestrator::new(daemon_config(logs.path(), 1), state.clone(), Box::new(spawner));
    daemon.poll_and_start_runs().await.unwrap();
    assert_eq!(daemon.tracked_count(), 1);

    daemon.stop_run("run-slow", Duration::from_secs(2)).await.unwrap();
    assert_eq!(daemon.tracked_count(), 0);
    let run = state.get_run("run-slow").await.unwrap().unwrap();
    assert_eq!(run.state, RunState::Failed);
}

// =============================================================================
// CLI
// =============================================================================

mod cli {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn pd(home: &TempDir) -> Command {
        let mut cmd = Command::cargo_bin("pd").expect("pd binary");
        cmd.env("HOME", home.path())
            .env("XDG_DATA_HOME", home.path().join("data"))
            .env("XDG_CONFIG_HOME", home.path().join("config"))
            .env("XDG_RUNTIME_DIR", home.path().join("run"))
            .current_dir(home.path());
        cmd
    }

    fn write_config(home: &TempDir) -> std::path::PathBuf {
        let path = home.path().join("pd.yml");
        let store = home.path().join("store");
        std::fs::write(&path, format!("storage:\n  store-dir: {}\n", store.display())).unwrap();
        path
    }

    #[test]
    fn test_help_lists_commands() {
        let home = TempDir::new().unwrap();
        pd(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("ledger").and(predicate::str::contains("daemon")));
    }

    #[test]
    #[serial]
    fn test_ledger_list_empty_store() {
        let home = TempDir::new().unwrap();
        let config = write_config(&home);
        pd(&home)
            .args(["--config"])
            .arg(&config)
            .args(["ledger", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No ledger entries found."));
    }

    #[test]
    #[serial]
    fn test_submit_rejects_cyclic_graph() {
        let home = TempDir::new().unwrap();
        let config = write_config(&home);
        let graph = home.path().join("graph.json");
        std::fs::write(
            &graph,
            r#"{"tasks": [
                {"task_id": "A", "task_kind": "code_edit", "depends_on": ["B"]},
                {"task_id": "B", "task_kind": "code_edit", "depends_on": ["A"]}
            ]}"#,
        )
        .unwrap();

        pd(&home)
            .arg("--config")
            .arg(&config)
            .arg("submit")
            .arg("--graph")
            .arg(&graph)
            .assert()
            .failure()
            .stderr(predicate::str::contains("ycle"));
    }

    #[test]
    #[serial]
    fn test_daemon_status_when_stopped() {
        let home = TempDir::new().unwrap();
        pd(&home)
            .args(["daemon", "status", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"running\": false"));
    }
}
