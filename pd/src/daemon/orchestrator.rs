//! Daemon orchestrator - the top-level control loop
//!
//! One control task, no in-process parallelism: every accepted run becomes
//! its own child process, and the daemon only tracks, polls and stops them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::DaemonError;
use super::process::{ChildProcess, ProcessSpawner, RunLogPaths};
use crate::config::DaemonConfig;
use crate::domain::{RunRecord, RunState, slugify};
use crate::state::StateManager;
use crate::worktree::WorktreeManager;

/// How often `stop_run` re-checks a signalled process
const STOP_POLL: Duration = Duration::from_millis(50);

/// Extra wait after SIGKILL before giving up on reaping
const KILL_GRACE: Duration = Duration::from_secs(2);

struct TrackedRun {
    child: Box<dyn ChildProcess>,
    started: Instant,
}

/// One tracked run in a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedRunStatus {
    pub run_id: String,
    pub pid: u32,
    pub elapsed_secs: u64,
}

/// Snapshot returned by [`DaemonOrchestrator::get_status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatus {
    pub accepting: bool,
    pub max_concurrent_runs: usize,
    pub available_slots: usize,
    pub running: Vec<TrackedRunStatus>,
    pub spawned: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Polls for pending runs and supervises one child process per run
pub struct DaemonOrchestrator {
    config: DaemonConfig,
    state: StateManager,
    spawner: Box<dyn ProcessSpawner>,
    worktrees: Option<Arc<WorktreeManager>>,
    tracked: BTreeMap<String, TrackedRun>,
    accepting: bool,
    spawned: u64,
    succeeded: u64,
    failed: u64,
}

impl DaemonOrchestrator {
    pub fn new(config: DaemonConfig, state: StateManager, spawner: Box<dyn ProcessSpawner>) -> Self {
        debug!(?config, "DaemonOrchestrator::new: called");
        Self {
            config,
            state,
            spawner,
            worktrees: None,
            tracked: BTreeMap::new(),
            accepting: true,
            spawned: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    /// Worktree manager used by `auto_cleanup_completed`
    pub fn with_worktrees(mut self, worktrees: Arc<WorktreeManager>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    /// Poll until SIGINT or SIGTERM, then stop every tracked run
    pub async fn start(&mut self) -> Result<(), DaemonError> {
        self.run_until(shutdown_signal()).await
    }

    /// Poll until `shutdown` resolves, then stop every tracked run
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        info!(
            max_concurrent_runs = self.config.max_concurrent_runs,
            poll_interval_seconds = self.config.poll_interval_seconds,
            "Daemon orchestrator started"
        );
        tokio::pin!(shutdown);

        loop {
            if let Err(e) = self.poll_and_start_runs().await {
                error!(error = %e, "Failed to start pending runs");
            }
            if let Err(e) = self.check_running_processes().await {
                error!(error = %e, "Failed to check running processes");
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.shutdown().await
    }

    /// Start the oldest pending runs up to remaining capacity
    ///
    /// Returns the ids of runs that now have a live child process.
    pub async fn poll_and_start_runs(&mut self) -> Result<Vec<String>, DaemonError> {
        if !self.accepting {
            debug!("DaemonOrchestrator::poll_and_start_runs: not accepting work");
            return Ok(Vec::new());
        }
        let capacity = self.config.max_concurrent_runs.saturating_sub(self.tracked.len());
        if capacity == 0 {
            debug!(tracked = self.tracked.len(), "DaemonOrchestrator::poll_and_start_runs: at capacity");
            return Ok(Vec::new());
        }

        let pending = self.state.list_pending(capacity).await?;
        debug!(capacity, pending = pending.len(), "DaemonOrchestrator::poll_and_start_runs: fetched pending");

        let mut started = Vec::new();
        for run in pending {
            if self.tracked.contains_key(&run.run_id) {
                continue;
            }
            // Claim first so the next poll cannot pick the run up again
            let run = match self.state.transition_run(&run.run_id, RunState::Running, Vec::new()).await {
                Ok(run) => run,
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "Could not claim pending run");
                    continue;
                }
            };
            match self.spawn_run(&run) {
                Ok(child) => {
                    let pid = child.id();
                    self.record_pid(&run, pid).await;
                    self.tracked.insert(
                        run.run_id.clone(),
                        TrackedRun {
                            child,
                            started: Instant::now(),
                        },
                    );
                    self.spawned += 1;
                    info!(run_id = %run.run_id, pid, "Run started");
                    started.push(run.run_id);
                }
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "Failed to spawn run");
                    self.failed += 1;
                    self.mark_failed(&run.run_id, None, &e.to_string()).await;
                }
            }
        }
        Ok(started)
    }

    fn spawn_run(&mut self, run: &RunRecord) -> Result<Box<dyn ChildProcess>, DaemonError> {
        let logs = RunLogPaths::for_run(&self.config.log_dir, &run.run_id);
        self.spawner.spawn(run, &logs)
    }

    async fn record_pid(&self, run: &RunRecord, pid: u32) {
        let mut run = run.clone();
        run.set_meta("pid", pid);
        if let Err(e) = self.state.update_run(run).await {
            warn!(error = %e, "Failed to record run pid");
        }
    }

    /// Reap exited children and write back their run state
    ///
    /// Returns `(run_id, exit_code)` for every run that finished.
    pub async fn check_running_processes(&mut self) -> Result<Vec<(String, i32)>, DaemonError> {
        let mut exited = Vec::new();
        for (run_id, tracked) in self.tracked.iter_mut() {
            match tracked.child.try_wait() {
                Ok(Some(code)) => exited.push((run_id.clone(), code)),
                Ok(None) => {}
                Err(e) => warn!(%run_id, error = %e, "Failed to poll run process"),
            }
        }

        for (run_id, code) in &exited {
            if let Some(tracked) = self.tracked.remove(run_id) {
                info!(%run_id, exit_code = code, elapsed_secs = tracked.started.elapsed().as_secs(), "Run process exited");
            }
            self.finish_run(run_id, *code).await;
        }
        Ok(exited)
    }

    async fn finish_run(&mut self, run_id: &str, code: i32) {
        if code == 0 {
            self.succeeded += 1;
            self.mark_succeeded(run_id).await;
            if self.config.auto_cleanup_completed {
                self.cleanup_worktrees(run_id).await;
            }
        } else {
            self.failed += 1;
            self.mark_failed(run_id, Some(code), &format!("run process exited with code {}", code))
                .await;
        }
    }

    /// The run process usually finalizes its own record; only fill the gap
    async fn current_state(&self, run_id: &str) -> Option<RunState> {
        match self.state.get_run(run_id).await {
            Ok(Some(run)) => Some(run.state),
            Ok(None) => {
                warn!(%run_id, "Run record disappeared");
                None
            }
            Err(e) => {
                error!(%run_id, error = %e, "Failed to load run");
                None
            }
        }
    }

    async fn mark_succeeded(&self, run_id: &str) {
        if self.current_state(run_id).await != Some(RunState::Running) {
            debug!(%run_id, "DaemonOrchestrator::mark_succeeded: run already finalized");
            return;
        }
        let metadata = vec![("exit_code".to_string(), json!(0))];
        if let Err(e) = self.state.transition_run(run_id, RunState::Succeeded, metadata).await {
            error!(%run_id, error = %e, "Failed to mark run succeeded");
        }
    }

    async fn mark_failed(&self, run_id: &str, code: Option<i32>, reason: &str) {
        match self.current_state(run_id).await {
            Some(state) if !matches!(state, RunState::Succeeded | RunState::Failed) => {}
            _ => {
                debug!(%run_id, "DaemonOrchestrator::mark_failed: run already finalized");
                return;
            }
        }
        let mut metadata = vec![("error".to_string(), json!(reason))];
        if let Some(code) = code {
            metadata.push(("exit_code".to_string(), json!(code)));
        }
        if let Err(e) = self.state.transition_run(run_id, RunState::Failed, metadata).await {
            error!(%run_id, error = %e, "Failed to mark run failed");
        }
    }

    async fn cleanup_worktrees(&self, run_id: &str) {
        let Some(worktrees) = &self.worktrees else {
            return;
        };
        let slug = slugify(run_id);
        let list = match worktrees.list().await {
            Ok(list) => list,
            Err(e) => {
                warn!(%run_id, error = %e, "Failed to list worktrees for cleanup");
                return;
            }
        };
        for info in list.into_iter().filter(|w| w.run_id.as_deref() == Some(slug.as_str())) {
            match worktrees.cleanup(&info.path, false, false).await {
                Ok(true) => info!(%run_id, path = ?info.path, "Cleaned up worktree of completed run"),
                Ok(false) => debug!(%run_id, path = ?info.path, "Worktree kept"),
                Err(e) => warn!(%run_id, error = %e, "Worktree cleanup failed"),
            }
        }
    }

    /// Two-phase stop: SIGTERM, wait up to `timeout`, then SIGKILL
    ///
    /// Returns false when the run was not tracked. The run is marked FAILED.
    pub async fn stop_run(&mut self, run_id: &str, timeout: Duration) -> Result<bool, DaemonError> {
        debug!(%run_id, ?timeout, "DaemonOrchestrator::stop_run: called");
        let Some(mut tracked) = self.tracked.remove(run_id) else {
            debug!(%run_id, "DaemonOrchestrator::stop_run: not tracked");
            return Ok(false);
        };
        let pid = tracked.child.id();
        info!(%run_id, pid, "Stopping run");

        tracked.child.terminate()?;
        let mut code = wait_for_exit(tracked.child.as_mut(), timeout).await;
        if code.is_none() {
            warn!(%run_id, pid, "Run did not stop gracefully, sending SIGKILL");
            tracked.child.kill()?;
            code = wait_for_exit(tracked.child.as_mut(), KILL_GRACE).await;
            if code.is_none() {
                error!(%run_id, pid, "Run process could not be reaped after SIGKILL");
            }
        }

        self.failed += 1;
        self.mark_failed(run_id, code, "stopped by daemon").await;
        Ok(true)
    }

    /// Stop accepting work and stop every tracked run
    pub async fn shutdown(&mut self) -> Result<(), DaemonError> {
        self.accepting = false;
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        info!(count = ids.len(), "Stopping tracked runs");
        let timeout = self.config.stop_timeout();
        for run_id in ids {
            if let Err(e) = self.stop_run(&run_id, timeout).await {
                error!(%run_id, error = %e, "Failed to stop run");
            }
        }
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        let running = self
            .tracked
            .iter()
            .map(|(run_id, t)| TrackedRunStatus {
                run_id: run_id.clone(),
                pid: t.child.id(),
                elapsed_secs: t.started.elapsed().as_secs(),
            })
            .collect();
        OrchestratorStatus {
            accepting: self.accepting,
            max_concurrent_runs: self.config.max_concurrent_runs,
            available_slots: self.config.max_concurrent_runs.saturating_sub(self.tracked.len()),
            running,
            spawned: self.spawned,
            succeeded: self.succeeded,
            failed: self.failed,
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }
}

async fn wait_for_exit(child: &mut dyn ChildProcess, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(e) => warn!(pid = child.id(), error = %e, "Failed to poll process"),
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(STOP_POLL).await;
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => debug!("shutdown_signal: SIGINT"),
                _ = sigterm.recv() => debug!("shutdown_signal: SIGTERM"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler, waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
