//! Process spawning seam for run child processes

use std::fs::{self, File};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, info};

use super::DaemonError;
use crate::domain::RunRecord;

/// Per-run stdout/stderr log files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl RunLogPaths {
    pub fn for_run(log_dir: &Path, run_id: &str) -> Self {
        Self {
            stdout: log_dir.join(format!("{}.stdout.log", run_id)),
            stderr: log_dir.join(format!("{}.stderr.log", run_id)),
        }
    }
}

/// A tracked child process
pub trait ChildProcess: Send {
    fn id(&self) -> u32;

    /// Exit code once the process has exited; signal deaths map to 128 + signal
    fn try_wait(&mut self) -> Result<Option<i32>, DaemonError>;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&mut self) -> Result<(), DaemonError>;

    /// Force the process to exit (SIGKILL)
    fn kill(&mut self) -> Result<(), DaemonError>;
}

/// Launches one child process per run
pub trait ProcessSpawner: Send {
    fn spawn(&mut self, run: &RunRecord, logs: &RunLogPaths) -> Result<Box<dyn ChildProcess>, DaemonError>;
}

/// Spawns `run_command + [run_id]` as a real OS process
#[derive(Debug, Clone)]
pub struct OsProcessSpawner {
    run_command: Vec<String>,
}

impl OsProcessSpawner {
    pub fn new(run_command: Vec<String>) -> Self {
        debug!(?run_command, "OsProcessSpawner::new: called");
        Self { run_command }
    }
}

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(&mut self, run: &RunRecord, logs: &RunLogPaths) -> Result<Box<dyn ChildProcess>, DaemonError> {
        debug!(run_id = %run.run_id, ?logs, "OsProcessSpawner::spawn: called");
        let (program, args) = self
            .run_command
            .split_first()
            .ok_or_else(|| DaemonError::SpawnFailed("run command is empty".to_string()))?;

        if let Some(dir) = logs.stdout.parent() {
            fs::create_dir_all(dir)?;
        }
        let stdout = File::create(&logs.stdout)?;
        let stderr = File::create(&logs.stderr)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(&run.run_id)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // Own process group so a terminal ctrl-c hits the daemon only
            .process_group(0);
        if let Some(graph) = run.graph_path() {
            command.arg("--graph").arg(graph);
        }

        let child = command
            .spawn()
            .map_err(|e| DaemonError::SpawnFailed(format!("{}: {}", program, e)))?;
        info!(run_id = %run.run_id, pid = child.id(), "Spawned run process");
        Ok(Box::new(OsChild { child }))
    }
}

struct OsChild {
    child: Child,
}

impl OsChild {
    /// Signal the whole process group; the child leads its own group
    fn send(&self, sig: nix::sys::signal::Signal) -> Result<(), DaemonError> {
        let pid = nix::unistd::Pid::from_raw(self.child.id() as i32);
        debug!(%pid, %sig, "OsChild::send: called");
        match nix::sys::signal::killpg(pid, sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(DaemonError::Signal(format!("{} to {}: {}", sig, pid, e))),
        }
    }
}

impl ChildProcess for OsChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, DaemonError> {
        Ok(self.child.try_wait()?.map(exit_code))
    }

    fn terminate(&mut self) -> Result<(), DaemonError> {
        self.send(nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&mut self) -> Result<(), DaemonError> {
        self.send(nix::sys::signal::Signal::SIGKILL)
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
