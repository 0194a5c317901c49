//! PatchDaemon configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::worktree::WorktreeConfig;

/// Main PatchDaemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Run daemon settings
    pub daemon: DaemonConfig,

    /// Worktree isolation
    pub worktree: WorktreeSection,

    /// Router documents and state
    pub router: RouterSection,

    /// Guardrail patterns and loop detection
    pub guardrails: GuardrailsSection,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local: .patchdaemon.yml
        let local_config = PathBuf::from(".patchdaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User: ~/.config/patchdaemon/patchdaemon.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("patchdaemon").join("patchdaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Run daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Ceiling on concurrently tracked run processes
    #[serde(rename = "max-concurrent-runs")]
    pub max_concurrent_runs: usize,

    #[serde(rename = "poll-interval-seconds")]
    pub poll_interval_seconds: u64,

    /// Remove worktrees of runs that succeeded
    #[serde(rename = "auto-cleanup-completed")]
    pub auto_cleanup_completed: bool,

    /// Per-run stdout/stderr logs land here
    #[serde(rename = "log-dir")]
    pub log_dir: PathBuf,

    /// Program and leading args; the run id is appended
    #[serde(rename = "run-command")]
    pub run_command: Vec<String>,

    /// Grace period between SIGTERM and SIGKILL for run processes
    #[serde(rename = "stop-timeout-seconds")]
    pub stop_timeout_seconds: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let log_dir = dirs::data_local_dir()
            .map(|d| d.join("patchdaemon").join("runs"))
            .unwrap_or_else(|| PathBuf::from(".patchdaemon/runs"));
        Self {
            max_concurrent_runs: 3,
            poll_interval_seconds: 5,
            auto_cleanup_completed: false,
            log_dir,
            run_command: vec!["pd".to_string(), "run".to_string()],
            stop_timeout_seconds: 10,
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

/// Worktree isolation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeSection {
    #[serde(rename = "repo-root")]
    pub repo_root: PathBuf,

    #[serde(rename = "isolation-dir")]
    pub isolation_dir: PathBuf,

    #[serde(rename = "archive-dir")]
    pub archive_dir: PathBuf,

    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    #[serde(rename = "prune-interval-seconds")]
    pub prune_interval_seconds: u64,
}

impl Default for WorktreeSection {
    fn default() -> Self {
        let defaults = WorktreeConfig::default();
        Self {
            repo_root: defaults.repo_root,
            isolation_dir: defaults.isolation_dir,
            archive_dir: defaults.archive_dir,
            branch_prefix: defaults.branch_prefix,
            prune_interval_seconds: defaults.prune_interval.as_secs(),
        }
    }
}

impl WorktreeSection {
    pub fn to_worktree_config(&self) -> WorktreeConfig {
        WorktreeConfig {
            repo_root: self.repo_root.clone(),
            isolation_dir: self.isolation_dir.clone(),
            archive_dir: self.archive_dir.clone(),
            branch_prefix: self.branch_prefix.clone(),
            prune_interval: Duration::from_secs(self.prune_interval_seconds),
        }
    }
}

/// Router document locations and state batching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Router configuration (apps, routing rules, defaults)
    #[serde(rename = "config-path")]
    pub config_path: PathBuf,

    /// Optional operation_kind -> tool_id document
    #[serde(rename = "profiles-path")]
    pub profiles_path: Option<PathBuf>,

    /// Round-robin indexes and tool metrics
    #[serde(rename = "state-file")]
    pub state_file: PathBuf,

    /// Persist state after this many updates
    #[serde(rename = "flush-every")]
    pub flush_every: usize,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(".patchdaemon/router.yml"),
            profiles_path: None,
            state_file: PathBuf::from(".patchdaemon/router_state.json"),
            flush_every: 10,
        }
    }
}

/// Guardrail patterns and loop detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsSection {
    /// Pattern registry; tasks run in legacy mode (protected paths and report checks only) when unset
    #[serde(rename = "patterns-file")]
    pub patterns_file: Option<PathBuf>,

    /// Globs no task may touch regardless of pattern
    #[serde(rename = "protected-paths")]
    pub protected_paths: Vec<String>,

    #[serde(rename = "planning-loop-threshold")]
    pub planning_loop_threshold: u32,

    #[serde(rename = "execution-loop-threshold")]
    pub execution_loop_threshold: u32,
}

impl Default for GuardrailsSection {
    fn default() -> Self {
        Self {
            patterns_file: None,
            protected_paths: vec![".git/**".to_string()],
            planning_loop_threshold: 3,
            execution_loop_threshold: 3,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the embedded database
    #[serde(rename = "store-dir")]
    pub store_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let store_dir = dirs::data_dir()
            .map(|d| d.join("patchdaemon"))
            .unwrap_or_else(|| PathBuf::from(".patchdaemon"));
        Self { store_dir }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.max_concurrent_runs, 3);
        assert_eq!(config.daemon.poll_interval_seconds, 5);
        assert!(!config.daemon.auto_cleanup_completed);
        assert_eq!(config.daemon.run_command, vec!["pd", "run"]);
        assert_eq!(config.router.flush_every, 10);
        assert_eq!(config.worktree.branch_prefix, "pd");
        assert_eq!(config.guardrails.execution_loop_threshold, 3);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

daemon:
  max-concurrent-runs: 2
  poll-interval-seconds: 1
  auto-cleanup-completed: true
  log-dir: /var/log/pd
  run-command: ["/usr/local/bin/pd", "run"]

worktree:
  repo-root: /src/project
  isolation-dir: .wt

router:
  config-path: router.yml
  profiles-path: profiles.yml
  flush-every: 1

guardrails:
  patterns-file: patterns.yml
  protected-paths: ["secrets/**"]
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.daemon.max_concurrent_runs, 2);
        assert_eq!(config.daemon.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.daemon.log_dir, PathBuf::from("/var/log/pd"));
        assert_eq!(config.daemon.stop_timeout_seconds, 10);
        assert_eq!(config.router.profiles_path, Some(PathBuf::from("profiles.yml")));
        assert_eq!(config.guardrails.protected_paths, vec!["secrets/**"]);

        let wt = config.worktree.to_worktree_config();
        assert_eq!(wt.repo_root, PathBuf::from("/src/project"));
        assert_eq!(wt.isolation_dir, PathBuf::from(".wt"));
        assert_eq!(wt.branch_prefix, "pd");
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pd.yml");
        fs::write(&path, "daemon:\n  max-concurrent-runs: 7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.daemon.max_concurrent_runs, 7);

        let missing = dir.path().join("missing.yml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
