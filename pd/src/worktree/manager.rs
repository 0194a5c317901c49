//! Worktree manager: one isolated git working copy and branch per run/step

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::porcelain::{PorcelainEntry, parse_worktree_list};
use crate::domain::slugify;

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Branch {0} is already checked out in another worktree")]
    BranchInUse(String),

    #[error("Failed to archive worktree: {0}")]
    ArchiveFailed(String),

    #[error("Failed to apply commit {sha}: {message}")]
    ApplyFailed { sha: String, message: String },

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Configuration for the worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Path to the main repository
    pub repo_root: PathBuf,

    /// Isolation directory; relative paths resolve against `repo_root`
    pub isolation_dir: PathBuf,

    /// Where `cleanup(.., archive = true)` copies worktrees
    pub archive_dir: PathBuf,

    /// Branch prefix for worktree branches
    pub branch_prefix: String,

    /// Minimum time between automatic `git worktree prune` runs
    pub prune_interval: Duration,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            isolation_dir: PathBuf::from(".worktrees"),
            archive_dir: PathBuf::from(".worktrees/_archive"),
            branch_prefix: "pd".to_string(),
            prune_interval: Duration::from_secs(3600),
        }
    }
}

impl WorktreeConfig {
    /// Create config with specified repo root
    pub fn with_repo(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        debug!(?repo_root, "WorktreeConfig::with_repo: called");
        Self {
            repo_root,
            ..Default::default()
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        }
    }

    pub fn isolation_path(&self) -> PathBuf {
        self.resolve(&self.isolation_dir)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.resolve(&self.archive_dir)
    }
}

/// Derived view of one managed worktree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub commit_hash: Option<String>,
    pub is_locked: bool,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
}

/// Separator between run and step in directory and branch names
const STEP_SEPARATOR: &str = "--";

/// Manager for git worktrees
pub struct WorktreeManager {
    config: WorktreeConfig,
    last_prune: Mutex<Option<Instant>>,
    exclude_ensured: AtomicBool,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        debug!(?config, "WorktreeManager::new: called");
        Self {
            config,
            last_prune: Mutex::new(None),
            exclude_ensured: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    /// Deterministic directory/branch stem for a run and optional step
    ///
    /// Distinct ids always get distinct stems, even when they slugify alike.
    pub fn worktree_name(run_id: &str, step_id: Option<&str>) -> String {
        match step_id {
            Some(step) => format!("{}{}{}", name_part(run_id), STEP_SEPARATOR, name_part(step)),
            None => name_part(run_id),
        }
    }

    /// Where the worktree for a run/step lives
    pub fn worktree_path(&self, run_id: &str, step_id: Option<&str>) -> PathBuf {
        self.config.isolation_path().join(Self::worktree_name(run_id, step_id))
    }

    /// Default branch for a run/step
    pub fn branch_name(&self, run_id: &str, step_id: Option<&str>) -> String {
        format!("{}/{}", self.config.branch_prefix, Self::worktree_name(run_id, step_id))
    }

    async fn git<I, S>(&self, dir: &Path, args: I) -> Result<Output, WorktreeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))
    }

    /// Run git and require success; returns trimmed stdout
    async fn git_ok<I, S>(&self, dir: &Path, args: I) -> Result<String, WorktreeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.git(dir, args).await?;
        if !output.status.success() {
            return Err(WorktreeError::GitError(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Create (or return the existing) worktree for a run/step
    ///
    /// Idempotent: a second call with the same ids returns the same path
    /// without touching git.
    pub async fn create(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        branch_name: Option<&str>,
        base_ref: Option<&str>,
    ) -> Result<PathBuf, WorktreeError> {
        debug!(%run_id, ?step_id, ?branch_name, ?base_ref, "WorktreeManager::create: called");
        self.ensure_ignore_entry().await?;
        if let Err(e) = self.maybe_prune().await {
            warn!(error = %e, "Worktree prune failed, continuing");
        }

        let path = self.worktree_path(run_id, step_id);
        let branch = branch_name
            .map(str::to_string)
            .unwrap_or_else(|| self.branch_name(run_id, step_id));
        let base_ref = base_ref.unwrap_or("HEAD");

        let entries = self.porcelain().await?;
        if let Some(existing) = entries.iter().find(|e| same_path(&e.path, &path)) {
            debug!(?path, "WorktreeManager::create: worktree already exists");
            if existing.branch.as_deref() != Some(branch.as_str()) {
                warn!(?path, expected = %branch, actual = ?existing.branch, "Existing worktree is on a different branch");
            }
            return Ok(path);
        }
        if path.exists() {
            return Err(WorktreeError::CreateFailed(format!(
                "{} exists but is not a registered worktree",
                path.display()
            )));
        }
        if entries.iter().any(|e| e.branch.as_deref() == Some(branch.as_str())) {
            return Err(WorktreeError::BranchInUse(branch));
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorktreeError::CreateFailed(format!("Failed to create isolation dir: {}", e)))?;
        }

        let branch_exists = self
            .git(&self.config.repo_root, ["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .await?
            .status
            .success();

        let mut args: Vec<&OsStr> = vec![OsStr::new("worktree"), OsStr::new("add")];
        if branch_exists {
            debug!(%branch, "WorktreeManager::create: reusing existing branch");
            args.extend([path.as_os_str(), OsStr::new(&branch)]);
        } else {
            args.extend([OsStr::new("-b"), OsStr::new(&branch), path.as_os_str(), OsStr::new(base_ref)]);
        }
        let output = self.git(&self.config.repo_root, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(%stderr, "WorktreeManager::create: git worktree add failed");
            return Err(WorktreeError::CreateFailed(stderr.trim().to_string()));
        }

        info!(?path, %branch, %base_ref, "Created worktree");
        Ok(path)
    }

    /// Remove a worktree, optionally archiving it first
    ///
    /// Returns false (and leaves the worktree alone) when it has uncommitted
    /// changes and `force` is not set, or when it does not exist.
    pub async fn cleanup(&self, path: &Path, archive: bool, force: bool) -> Result<bool, WorktreeError> {
        debug!(?path, archive, force, "WorktreeManager::cleanup: called");
        if !path.exists() {
            debug!("WorktreeManager::cleanup: path does not exist");
            warn!(?path, "Worktree does not exist, nothing to clean up");
            return Ok(false);
        }

        let status = self.git_ok(path, ["status", "--porcelain"]).await?;
        if !status.is_empty() && !force {
            warn!(?path, "Worktree has uncommitted changes, refusing to remove without force");
            return Ok(false);
        }

        if archive {
            let archived = self.archive(path).await?;
            info!(?path, ?archived, "Archived worktree");
        }

        let mut args: Vec<&OsStr> = vec![OsStr::new("worktree"), OsStr::new("remove")];
        if force {
            args.push(OsStr::new("--force"));
        }
        args.push(path.as_os_str());
        let output = self.git(&self.config.repo_root, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::RemoveFailed(stderr.trim().to_string()));
        }

        info!(?path, "Removed worktree");
        Ok(true)
    }

    /// Copy the worktree (minus its `.git` link) to a timestamped archive dir
    async fn archive(&self, path: &Path) -> Result<PathBuf, WorktreeError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "worktree".to_string());
        let stamp = chrono::Local::now().format("%Y%m%dT%H%M%S%3f");
        let dest = self.config.archive_path().join(format!("{}-{}", name, stamp));
        debug!(?path, ?dest, "WorktreeManager::archive: called");

        let src = path.to_path_buf();
        let target = dest.clone();
        tokio::task::spawn_blocking(move || copy_tree(&src, &target))
            .await
            .map_err(|e| WorktreeError::ArchiveFailed(e.to_string()))?
            .map_err(|e| WorktreeError::ArchiveFailed(e.to_string()))?;
        Ok(dest)
    }

    async fn porcelain(&self) -> Result<Vec<PorcelainEntry>, WorktreeError> {
        let stdout = self
            .git_ok(&self.config.repo_root, ["worktree", "list", "--porcelain"])
            .await?;
        Ok(parse_worktree_list(&stdout))
    }

    /// Worktrees under the isolation directory
    pub async fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        debug!("WorktreeManager::list: called");
        let isolation = canonical(&self.config.isolation_path());
        let archive = canonical(&self.config.archive_path());
        let prefix = format!("{}/", self.config.branch_prefix);

        let worktrees: Vec<WorktreeInfo> = self
            .porcelain()
            .await?
            .into_iter()
            .filter(|e| {
                let p = canonical(&e.path);
                p.starts_with(&isolation) && !p.starts_with(&archive)
            })
            .map(|e| {
                let (run_id, step_id) = e
                    .branch
                    .as_deref()
                    .and_then(|b| b.strip_prefix(prefix.as_str()))
                    .map(|stem| match stem.split_once(STEP_SEPARATOR) {
                        Some((run, step)) => (Some(run.to_string()), Some(step.to_string())),
                        None => (Some(stem.to_string()), None),
                    })
                    .unwrap_or((None, None));
                WorktreeInfo {
                    path: e.path,
                    branch: e.branch,
                    commit_hash: e.head,
                    is_locked: e.locked,
                    run_id,
                    step_id,
                }
            })
            .collect();
        debug!(count = worktrees.len(), "WorktreeManager::list: returning worktrees");
        Ok(worktrees)
    }

    /// Whether any worktree (managed or not) has `branch` checked out
    pub async fn is_branch_checked_out(&self, branch: &str) -> Result<bool, WorktreeError> {
        debug!(%branch, "WorktreeManager::is_branch_checked_out: called");
        Ok(self
            .porcelain()
            .await?
            .iter()
            .any(|e| e.branch.as_deref() == Some(branch)))
    }

    /// Drop administrative data for worktrees deleted behind git's back
    pub async fn prune(&self) -> Result<usize, WorktreeError> {
        debug!("WorktreeManager::prune: called");
        let before = self.porcelain().await?.len();
        self.git_ok(&self.config.repo_root, ["worktree", "prune"]).await?;
        let after = self.porcelain().await?.len();
        if let Ok(mut last) = self.last_prune.lock() {
            *last = Some(Instant::now());
        }
        let pruned = before.saturating_sub(after);
        if pruned > 0 {
            info!(pruned, "Pruned stale worktree metadata");
        }
        Ok(pruned)
    }

    /// Prune at most once per configured interval
    pub async fn maybe_prune(&self) -> Result<Option<usize>, WorktreeError> {
        let due = match self.last_prune.lock() {
            Ok(last) => last.is_none_or(|t| t.elapsed() >= self.config.prune_interval),
            Err(_) => true,
        };
        if !due {
            debug!("WorktreeManager::maybe_prune: not due");
            return Ok(None);
        }
        self.prune().await.map(Some)
    }

    /// Add the isolation directory to `.git/info/exclude` (once per manager)
    async fn ensure_ignore_entry(&self) -> Result<(), WorktreeError> {
        if self.exclude_ensured.load(Ordering::Acquire) {
            return Ok(());
        }
        let repo = canonical(&self.config.repo_root);
        let isolation = canonical(&self.config.isolation_path());
        let Ok(relative) = isolation.strip_prefix(&repo) else {
            debug!("WorktreeManager::ensure_ignore_entry: isolation dir outside repo");
            self.exclude_ensured.store(true, Ordering::Release);
            return Ok(());
        };
        let entry = format!("/{}/", relative.to_string_lossy().trim_end_matches('/'));

        let common_dir = self
            .git_ok(&self.config.repo_root, ["rev-parse", "--git-common-dir"])
            .await?;
        let common_dir = self.config.resolve(Path::new(&common_dir));
        let exclude = common_dir.join("info").join("exclude");

        let existing = tokio::fs::read_to_string(&exclude).await.unwrap_or_default();
        if !existing.lines().any(|l| l.trim() == entry) {
            debug!(?exclude, %entry, "WorktreeManager::ensure_ignore_entry: adding entry");
            if let Some(parent) = exclude.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| WorktreeError::GitError(e.to_string()))?;
            }
            let mut content = existing;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&entry);
            content.push('\n');
            tokio::fs::write(&exclude, content)
                .await
                .map_err(|e| WorktreeError::GitError(e.to_string()))?;
            info!(%entry, "Excluded isolation directory from version control");
        }
        self.exclude_ensured.store(true, Ordering::Release);
        Ok(())
    }

    /// Stage everything and summarize the pending change
    pub async fn stage_and_summarize(&self, worktree: &Path) -> Result<ChangeSummary, WorktreeError> {
        debug!(?worktree, "WorktreeManager::stage_and_summarize: called");
        self.git_ok(worktree, ["add", "-A"]).await?;
        // Renames as delete + add, so both paths are reported
        let numstat = self
            .git_ok(worktree, ["diff", "--cached", "--no-renames", "--numstat"])
            .await?;
        let patch = self
            .git_ok(worktree, ["diff", "--cached", "--no-renames", "-U0"])
            .await?;
        Ok(ChangeSummary::from_git(&numstat, &patch))
    }

    /// Reset a worktree to its last commit: staged, unstaged and untracked changes go
    pub async fn discard_changes(&self, worktree: &Path) -> Result<(), WorktreeError> {
        debug!(?worktree, "WorktreeManager::discard_changes: called");
        if same_path(worktree, &self.config.repo_root) {
            return Err(WorktreeError::GitError(format!(
                "refusing to discard changes in the main checkout {}",
                worktree.display()
            )));
        }
        self.git_ok(worktree, ["reset", "--hard", "--quiet", "HEAD"]).await?;
        self.git_ok(worktree, ["clean", "-fdq"]).await?;
        info!(?worktree, "Discarded uncommitted worktree changes");
        Ok(())
    }

    /// Cherry-pick `sha` onto the branch checked out in the main repository
    ///
    /// A failed pick is aborted, so the main checkout is left as it was.
    pub async fn apply_commit(&self, sha: &str) -> Result<String, WorktreeError> {
        debug!(%sha, "WorktreeManager::apply_commit: called");
        let repo = &self.config.repo_root;
        let failed = |message: String| WorktreeError::ApplyFailed {
            sha: sha.to_string(),
            message,
        };

        let object = format!("{}^{{commit}}", sha);
        if !self.git(repo, ["cat-file", "-e", object.as_str()]).await?.status.success() {
            return Err(failed("not a commit in this repository".to_string()));
        }

        let output = self.git(repo, ["cherry-pick", "--allow-empty", sha]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Err(e) = self.git_ok(repo, ["cherry-pick", "--abort"]).await {
                warn!(%sha, error = %e, "Could not abort failed cherry-pick");
            }
            return Err(failed(stderr));
        }

        let head = self.git_ok(repo, ["rev-parse", "HEAD"]).await?;
        info!(%sha, %head, "Applied commit to main checkout");
        Ok(head)
    }

    /// Commit everything; None when there was nothing to commit
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<Option<String>, WorktreeError> {
        debug!(?worktree, %message, "WorktreeManager::commit_all: called");
        let status = self.git_ok(worktree, ["status", "--porcelain"]).await?;
        if status.is_empty() {
            debug!("WorktreeManager::commit_all: no uncommitted changes");
            return Ok(None);
        }
        self.git_ok(worktree, ["add", "-A"]).await?;
        self.git_ok(worktree, ["commit", "-m", message]).await?;
        let sha = self.git_ok(worktree, ["rev-parse", "HEAD"]).await?;
        info!(?worktree, %sha, "Committed worktree changes");
        Ok(Some(sha))
    }
}

/// Volume of a pending change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub files: Vec<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub hunks: u64,
}

impl ChangeSummary {
    /// Build from `git diff --numstat` and `git diff -U0` output
    pub fn from_git(numstat: &str, patch: &str) -> Self {
        let mut summary = Self::default();
        for line in numstat.lines() {
            let mut parts = line.splitn(3, '\t');
            let (Some(added), Some(removed), Some(file)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            // Binary files report "-"
            summary.lines_added += added.parse::<u64>().unwrap_or(0);
            summary.lines_removed += removed.parse::<u64>().unwrap_or(0);
            summary.files.push(file.to_string());
        }
        summary.hunks = patch.lines().filter(|l| l.starts_with("@@")).count() as u64;
        summary
    }

    pub fn files_changed(&self) -> usize {
        self.files.len()
    }

    pub fn lines_changed(&self) -> u64 {
        self.lines_added + self.lines_removed
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Slug of `id`, plus a short digest of the raw id when slugging lost information
fn name_part(id: &str) -> String {
    let slug = slugify(id);
    if slug == id {
        return slug;
    }
    let digest = format!("{:x}", Sha256::digest(id.as_bytes()));
    if slug.is_empty() {
        digest[..8].to_string()
    } else {
        format!("{}-{}", slug, &digest[..8])
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn same_path(a: &Path, b: &Path) -> bool {
    canonical(a) == canonical(b)
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let walker = walkdir::WalkDir::new(src)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
