//! PID file guarding the single control process

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{debug, info, warn};

/// How long `stop` waits between SIGTERM and SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Default PID file location
fn default_pid_path() -> PathBuf {
    let path = dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("patchdaemon")
        .join("patchdaemon.pid");
    debug!(?path, "default_pid_path: returning path");
    path
}

/// Daemon process manager
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonManager {
    /// Create a daemon manager with the default PID file location
    pub fn new() -> Self {
        Self::with_pid_file(default_pid_path())
    }

    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        debug!(?pid_file, "DaemonManager::with_pid_file: called");
        Self { pid_file }
    }

    pub fn is_running(&self) -> bool {
        self.running_pid().is_some()
    }

    /// PID of the live daemon; a stale PID file reads as None
    pub fn running_pid(&self) -> Option<u32> {
        let result = self.read_pid().filter(|&pid| is_process_running(pid));
        debug!(?result, "DaemonManager::running_pid: returning");
        result
    }

    fn read_pid(&self) -> Option<u32> {
        let contents = fs::read_to_string(&self.pid_file).ok()?;
        let pid = contents.trim().parse().ok();
        debug!(?pid, "DaemonManager::read_pid: returning");
        pid
    }

    fn write_pid(&self, pid: u32) -> Result<()> {
        debug!(pid, ?self.pid_file, "DaemonManager::write_pid: called");
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }
        fs::write(&self.pid_file, pid.to_string()).context("Failed to write PID file")?;
        Ok(())
    }

    fn remove_pid_file(&self) -> Result<()> {
        if self.pid_file.exists() {
            debug!(?self.pid_file, "DaemonManager::remove_pid_file: removing");
            fs::remove_file(&self.pid_file).context("Failed to remove PID file")?;
        }
        Ok(())
    }

    /// Spawn `<current exe> run-daemon` detached and record its PID
    pub fn start(&self, config_path: Option<&std::path::Path>) -> Result<u32> {
        debug!(?config_path, "DaemonManager::start: called");
        if let Some(pid) = self.running_pid() {
            return Err(eyre::eyre!("Daemon already running with PID {}", pid));
        }

        let exe = std::env::current_exe().context("Failed to get current executable")?;
        let mut command = Command::new(&exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        let child = command
            .arg("run-daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        let pid = child.id();
        self.write_pid(pid)?;
        info!(pid, "Daemon started");
        Ok(pid)
    }

    /// SIGTERM, wait up to 5s, then SIGKILL
    pub fn stop(&self) -> Result<()> {
        debug!("DaemonManager::stop: called");
        let pid = self.running_pid().ok_or_else(|| eyre::eyre!("Daemon is not running"))?;

        info!(pid, "Stopping daemon...");
        signal(pid, nix::sys::signal::Signal::SIGTERM).context("Failed to send SIGTERM")?;

        let deadline = std::time::Instant::now() + STOP_GRACE;
        while is_process_running(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }

        if is_process_running(pid) {
            warn!(pid, "Daemon did not stop gracefully, sending SIGKILL");
            let _ = signal(pid, nix::sys::signal::Signal::SIGKILL);
        } else {
            debug!("DaemonManager::stop: process exited gracefully");
        }

        self.remove_pid_file()?;
        info!(pid, "Daemon stopped");
        Ok(())
    }

    /// Record the current process as the daemon
    ///
    /// Refuses when another live daemon already owns the PID file.
    pub fn register_self(&self) -> Result<()> {
        let pid = std::process::id();
        debug!(pid, "DaemonManager::register_self: called");
        if let Some(other) = self.running_pid()
            && other != pid
        {
            return Err(eyre::eyre!("Daemon already running with PID {}", other));
        }
        self.write_pid(pid)?;
        info!(pid, "Daemon registered");
        Ok(())
    }

    /// Remove our PID file on shutdown, leaving another daemon's alone
    pub fn unregister_self(&self) -> Result<()> {
        if self.read_pid() == Some(std::process::id()) {
            self.remove_pid_file()?;
        }
        Ok(())
    }

    pub fn pid_file(&self) -> &PathBuf {
        &self.pid_file
    }

    pub fn status(&self) -> DaemonStatus {
        let pid = self.running_pid();
        let status = DaemonStatus {
            running: pid.is_some(),
            pid,
            pid_file: self.pid_file.clone(),
        };
        debug!(?status, "DaemonManager::status: returning");
        status
    }
}

/// Daemon status information
#[derive(Debug)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub pid_file: PathBuf,
}

fn signal(pid: u32, sig: nix::sys::signal::Signal) -> nix::Result<()> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
}

/// Check if a process with the given PID is running
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 checks for existence without delivering anything
    let result = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
    debug!(pid, result, "is_process_running: checked");
    result
}
