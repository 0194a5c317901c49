//! Guardrails: pattern-scoped pre/post execution checks
//!
//! A pattern names the tools, paths, operations and change volume a task may
//! use. Critical violations block the step; everything else is recorded.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use glob::{MatchOptions, Pattern as GlobPattern};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::adapter::ToolOutcome;
use crate::domain::Task;
use crate::worktree::ChangeSummary;

/// Errors loading guardrail documents
#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("Invalid glob {glob:?} in pattern {pattern}: {message}")]
    InvalidGlob { pattern: String, glob: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Violation severity, ordered from least to most serious
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Task has no pattern (legacy mode)
    NoPattern,
    UnknownPattern,
    PatternDisabled,
    ProtectedPath,
    /// Absolute, or climbs out of the worktree with `..`
    PathEscapesWorktree,
    PathExcluded,
    PathOutOfScope,
    ToolNotAllowed,
    ForbiddenOperation,
    ChangeLimitExceeded,
    HallucinatedSuccess,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoPattern => "no_pattern",
            Self::UnknownPattern => "unknown_pattern",
            Self::PatternDisabled => "pattern_disabled",
            Self::ProtectedPath => "protected_path",
            Self::PathEscapesWorktree => "path_escapes_worktree",
            Self::PathExcluded => "path_excluded",
            Self::PathOutOfScope => "path_out_of_scope",
            Self::ToolNotAllowed => "tool_not_allowed",
            Self::ForbiddenOperation => "forbidden_operation",
            Self::ChangeLimitExceeded => "change_limit_exceeded",
            Self::HallucinatedSuccess => "hallucinated_success",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
        }
    }
}

/// Violations found by one check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub violations: Vec<Violation>,
}

impl CheckReport {
    pub fn push(&mut self, violation: Violation) {
        debug!(kind = %violation.kind, severity = %violation.severity, message = %violation.message, "CheckReport::push: called");
        self.violations.push(violation);
    }

    /// Any critical violation blocks the step
    pub fn is_blocked(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Critical)
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    /// Messages of the critical violations, joined for an error string
    pub fn blocking_reason(&self) -> Option<String> {
        let reasons: Vec<&str> = self
            .violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .map(|v| v.message.as_str())
            .collect();
        (!reasons.is_empty()).then(|| reasons.join("; "))
    }
}

/// Change-volume ceilings for a pattern
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeLimits {
    pub max_files: Option<usize>,
    pub max_lines: Option<u64>,
    pub max_hunks: Option<u64>,
}

/// A guardrail-governed operation template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pattern {
    pub enabled: bool,
    pub description: Option<String>,
    /// Paths the pattern may touch
    pub include: Vec<String>,
    /// Paths carved out of `include`
    pub exclude: Vec<String>,
    /// Empty means any tool
    pub allowed_tools: Vec<String>,
    pub forbidden_operations: Vec<String>,
    pub limits: ChangeLimits,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            enabled: true,
            description: None,
            include: vec!["**".to_string()],
            exclude: Vec::new(),
            allowed_tools: Vec::new(),
            forbidden_operations: Vec::new(),
            limits: ChangeLimits::default(),
        }
    }
}

/// Patterns by id plus the global protected-path list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternRegistry {
    pub protected_paths: Vec<String>,
    pub patterns: BTreeMap<String, Pattern>,
}

impl PatternRegistry {
    /// Parse YAML (or JSON) and check every glob
    pub fn from_yaml(content: &str) -> Result<Self, GuardrailError> {
        let registry: Self = serde_yaml::from_str(content)?;
        registry.check()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, GuardrailError> {
        debug!(?path, "PatternRegistry::load: called");
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Builder: extra protected globs (from the main config)
    pub fn with_protected_paths<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for glob in globs {
            let glob = glob.into();
            if !self.protected_paths.contains(&glob) {
                self.protected_paths.push(glob);
            }
        }
        self
    }

    pub fn get(&self, pattern_id: &str) -> Option<&Pattern> {
        self.patterns.get(pattern_id)
    }

    fn check(&self) -> Result<(), GuardrailError> {
        let invalid = |pattern: &str, glob: &str, e: glob::PatternError| GuardrailError::InvalidGlob {
            pattern: pattern.to_string(),
            glob: glob.to_string(),
            message: e.to_string(),
        };
        for glob in &self.protected_paths {
            GlobPattern::new(glob).map_err(|e| invalid("protected_paths", glob, e))?;
        }
        for (id, pattern) in &self.patterns {
            for glob in pattern.include.iter().chain(&pattern.exclude) {
                GlobPattern::new(glob).map_err(|e| invalid(id, glob, e))?;
            }
        }
        Ok(())
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Resolve `.` and `..` lexically; None for absolute paths and paths above the root
fn normalize(path: &str) -> Option<String> {
    if path.starts_with('/') || path.starts_with('\\') || Path::new(path).has_root() {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    Some(parts.join("/"))
}

/// `path` must already be normalized
fn matches_any(globs: &[String], path: &str) -> bool {
    globs.iter().any(|g| {
        GlobPattern::new(g)
            .map(|p| p.matches_with(path, MATCH_OPTIONS))
            .unwrap_or(false)
    })
}

/// What a tool claims about its own run (last JSON line of stdout)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolReport {
    pub status: Option<String>,
    pub exit_code: Option<i32>,
    pub patch_id: Option<String>,
    pub files_changed: Option<usize>,
    pub lines_changed: Option<u64>,
    pub hunks: Option<u64>,
    pub tests_run: Option<u64>,
    pub tests_passed: Option<u64>,
}

impl ToolReport {
    pub fn from_outcome(outcome: &ToolOutcome) -> Option<Self> {
        outcome
            .report_json()
            .and_then(|v: Value| serde_json::from_value(v).ok())
    }

    pub fn claims_success(&self) -> bool {
        matches!(
            self.status.as_deref().map(str::to_lowercase).as_deref(),
            Some("completed" | "complete" | "success" | "succeeded" | "ok" | "done")
        )
    }
}

/// Pre/post execution checks
pub trait Guardrails: Send + Sync {
    /// Before the tool runs: pattern, paths, tools, operations
    fn pre_check(&self, task: &Task, tool_id: &str) -> CheckReport;

    /// After the tool ran: paths actually changed, change limits, hallucinated success
    fn post_check(
        &self,
        task: &Task,
        outcome: &ToolOutcome,
        changes: Option<&ChangeSummary>,
        worktree: &Path,
    ) -> CheckReport;
}

/// Guardrails backed by a [`PatternRegistry`]
pub struct PatternGuardrails {
    registry: PatternRegistry,
}

impl PatternGuardrails {
    pub fn new(registry: PatternRegistry) -> Self {
        debug!(patterns = registry.patterns.len(), "PatternGuardrails::new: called");
        Self { registry }
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    /// Escaping and protected paths; returns the normalized paths that are neither
    fn check_protected(&self, files: &[String], report: &mut CheckReport) -> Vec<String> {
        let mut allowed = Vec::with_capacity(files.len());
        for file in files {
            let Some(path) = normalize(file) else {
                report.push(Violation::new(
                    ViolationKind::PathEscapesWorktree,
                    Severity::Critical,
                    format!("{} escapes the worktree", file),
                ));
                continue;
            };
            if matches_any(&self.registry.protected_paths, &path) {
                report.push(Violation::new(
                    ViolationKind::ProtectedPath,
                    Severity::Critical,
                    format!("{} is a protected path", file),
                ));
                continue;
            }
            allowed.push(path);
        }
        allowed
    }
}

fn check_scope(pattern_id: &str, pattern: &Pattern, paths: &[String], report: &mut CheckReport) {
    for path in paths {
        if matches_any(&pattern.exclude, path) {
            report.push(Violation::new(
                ViolationKind::PathExcluded,
                Severity::Critical,
                format!("{} is excluded by pattern {}", path, pattern_id),
            ));
        } else if !matches_any(&pattern.include, path) {
            report.push(Violation::new(
                ViolationKind::PathOutOfScope,
                Severity::High,
                format!("{} is outside the scope of pattern {}", path, pattern_id),
            ));
        }
    }
}

impl Guardrails for PatternGuardrails {
    fn pre_check(&self, task: &Task, tool_id: &str) -> CheckReport {
        debug!(task_id = %task.task_id, %tool_id, pattern_id = ?task.pattern_id(), "PatternGuardrails::pre_check: called");
        let mut report = CheckReport::default();
        let paths = self.check_protected(&task.files(), &mut report);

        let Some(pattern_id) = task.pattern_id() else {
            warn!(task_id = %task.task_id, "Task declares no pattern, running in legacy mode");
            report.push(Violation::new(
                ViolationKind::NoPattern,
                Severity::Warning,
                format!("task {} declares no pattern", task.task_id),
            ));
            return report;
        };

        let Some(pattern) = self.registry.get(pattern_id) else {
            report.push(Violation::new(
                ViolationKind::UnknownPattern,
                Severity::Critical,
                format!("pattern {} does not exist", pattern_id),
            ));
            return report;
        };
        if !pattern.enabled {
            report.push(Violation::new(
                ViolationKind::PatternDisabled,
                Severity::Critical,
                format!("pattern {} is disabled", pattern_id),
            ));
            return report;
        }

        check_scope(pattern_id, pattern, &paths, &mut report);

        if !pattern.allowed_tools.is_empty() {
            let mut tools = vec![tool_id.to_string()];
            tools.extend(task.tools());
            for tool in tools {
                if !pattern.allowed_tools.contains(&tool) {
                    report.push(Violation::new(
                        ViolationKind::ToolNotAllowed,
                        Severity::Critical,
                        format!("tool {} is not allowed by pattern {}", tool, pattern_id),
                    ));
                }
            }
        }

        for op in task.operations() {
            if pattern.forbidden_operations.contains(&op) {
                report.push(Violation::new(
                    ViolationKind::ForbiddenOperation,
                    Severity::Critical,
                    format!("operation {} is forbidden by pattern {}", op, pattern_id),
                ));
            }
        }
        report
    }

    fn post_check(
        &self,
        task: &Task,
        outcome: &ToolOutcome,
        changes: Option<&ChangeSummary>,
        worktree: &Path,
    ) -> CheckReport {
        debug!(task_id = %task.task_id, exit_code = outcome.exit_code, "PatternGuardrails::post_check: called");
        let mut report = CheckReport::default();
        let tool_report = ToolReport::from_outcome(outcome);

        // What the tool touched, whatever the task declared
        if let Some(changes) = changes {
            let paths = self.check_protected(&changes.files, &mut report);
            if let Some(pattern_id) = task.pattern_id()
                && let Some(pattern) = self.registry.get(pattern_id).filter(|p| p.enabled)
            {
                check_scope(pattern_id, pattern, &paths, &mut report);
            }
        }
        if let Some(pattern) = task.pattern_id().and_then(|id| self.registry.get(id)) {
            check_limits(&pattern.limits, changes, tool_report.as_ref(), &mut report);
        }
        check_claimed_success(task, outcome, tool_report.as_ref(), worktree, &mut report);
        report
    }
}

fn check_limits(
    limits: &ChangeLimits,
    changes: Option<&ChangeSummary>,
    tool_report: Option<&ToolReport>,
    report: &mut CheckReport,
) {
    // Observed changes win over what the tool says
    let files = changes
        .map(ChangeSummary::files_changed)
        .or_else(|| tool_report.and_then(|r| r.files_changed));
    let lines = changes
        .map(ChangeSummary::lines_changed)
        .or_else(|| tool_report.and_then(|r| r.lines_changed));
    let hunks = changes.map(|c| c.hunks).or_else(|| tool_report.and_then(|r| r.hunks));

    let mut exceeded = |what: &str, actual: u64, max: u64| {
        if actual > max {
            report.push(Violation::new(
                ViolationKind::ChangeLimitExceeded,
                Severity::High,
                format!("{} {} exceeds limit {}", what, actual, max),
            ));
        }
    };
    if let (Some(actual), Some(max)) = (files, limits.max_files) {
        exceeded("files changed", actual as u64, max as u64);
    }
    if let (Some(actual), Some(max)) = (lines, limits.max_lines) {
        exceeded("lines changed", actual, max);
    }
    if let (Some(actual), Some(max)) = (hunks, limits.max_hunks) {
        exceeded("hunks", actual, max);
    }
}

/// A task that claims success must actually have succeeded
fn check_claimed_success(
    task: &Task,
    outcome: &ToolOutcome,
    tool_report: Option<&ToolReport>,
    worktree: &Path,
    report: &mut CheckReport,
) {
    let claims_success = match tool_report {
        Some(r) if r.status.is_some() => r.claims_success(),
        _ => outcome.exit_code == 0,
    };
    if !claims_success {
        return;
    }

    let mut hallucinated = |message: String| {
        report.push(Violation::new(
            ViolationKind::HallucinatedSuccess,
            Severity::Critical,
            format!("hallucinated success: {}", message),
        ));
    };

    let exit_code = tool_report.and_then(|r| r.exit_code).unwrap_or(outcome.exit_code);
    if exit_code != 0 || outcome.exit_code != 0 {
        hallucinated(format!("task {} reports success with exit code {}", task.task_id, exit_code.max(outcome.exit_code)));
    }
    if outcome.timed_out {
        hallucinated(format!("task {} reports success but timed out", task.task_id));
    }
    for output in task.expected_outputs() {
        if !worktree.join(&output).exists() {
            hallucinated(format!("expected output {} does not exist", output));
        }
    }
    if let Some(r) = tool_report
        && let (Some(run), Some(passed)) = (r.tests_run, r.tests_passed)
        && run != passed
    {
        hallucinated(format!("{} of {} tests passed", passed, run));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const PATTERNS: &str = r#"
protected_paths: ["secrets/**"]
patterns:
  small_edit:
    include: ["src/**", "tests/**"]
    exclude: ["src/generated/**"]
    allowed_tools: ["aider", "codex"]
    forbidden_operations: ["delete_file"]
    limits:
      max_files: 2
      max_lines: 10
  retired:
    enabled: false
"#;

    fn guardrails() -> PatternGuardrails {
        PatternGuardrails::new(PatternRegistry::from_yaml(PATTERNS).unwrap())
    }

    fn task(pattern: Option<&str>, files: &[&str]) -> Task {
        let mut t = Task::new("t1", "code_edit").with_meta("files", json!(files));
        if let Some(p) = pattern {
            t = t.with_meta("pattern_id", p);
        }
        t
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_clean_task_passes() {
        let report = guardrails().pre_check(&task(Some("small_edit"), &["src/lib.rs", "./tests/a.rs"]), "aider");
        assert!(report.is_clean(), "{:?}", report);
    }

    #[test]
    fn test_scope_and_exclusion() {
        let report = guardrails().pre_check(&task(Some("small_edit"), &["docs/readme.md", "src/generated/x.rs"]), "aider");
        assert!(report.has(ViolationKind::PathOutOfScope));
        assert!(report.has(ViolationKind::PathExcluded));
        assert!(report.is_blocked());
    }

    #[test]
    fn test_out_of_scope_alone_does_not_block() {
        let report = guardrails().pre_check(&task(Some("small_edit"), &["docs/readme.md"]), "aider");
        assert_eq!(report.max_severity(), Some(Severity::High));
        assert!(!report.is_blocked());
    }

    #[test]
    fn test_protected_path_blocks_even_legacy_tasks() {
        let report = guardrails().pre_check(&task(None, &["secrets/key.pem"]), "aider");
        assert!(report.has(ViolationKind::ProtectedPath));
        assert!(report.has(ViolationKind::NoPattern));
        assert!(report.is_blocked());
    }

    #[test]
    fn test_legacy_task_is_warned_not_blocked() {
        let report = guardrails().pre_check(&task(None, &["anything.txt"]), "whatever");
        assert_eq!(report.max_severity(), Some(Severity::Warning));
        assert!(!report.is_blocked());
    }

    #[test]
    fn test_unknown_and_disabled_patterns_block() {
        let g = guardrails();
        assert!(g.pre_check(&task(Some("nope"), &[]), "aider").has(ViolationKind::UnknownPattern));
        let report = g.pre_check(&task(Some("retired"), &[]), "aider");
        assert!(report.has(ViolationKind::PatternDisabled));
        assert!(report.is_blocked());
    }

    #[test]
    fn test_tools_and_operations() {
        let t = task(Some("small_edit"), &["src/a.rs"])
            .with_meta("tools", json!(["rm"]))
            .with_meta("operations", json!(["edit", "delete_file"]));
        let report = guardrails().pre_check(&t, "shell");
        let kinds: Vec<_> = report.violations.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::ToolNotAllowed,
                ViolationKind::ToolNotAllowed,
                ViolationKind::ForbiddenOperation
            ]
        );
        assert_eq!(report.blocking_reason().unwrap().matches("; ").count(), 2);
    }

    #[test]
    fn test_completed_with_exit_code_one_is_hallucinated() {
        let dir = tempdir().unwrap();
        let outcome = ToolOutcome {
            exit_code: 1,
            stdout: "{\"status\": \"completed\"}\n".to_string(),
            ..Default::default()
        };
        let report = guardrails().post_check(&task(None, &[]), &outcome, None, dir.path());
        assert!(report.has(ViolationKind::HallucinatedSuccess));
        assert!(report.is_blocked());
    }

    #[test]
    fn test_honest_failure_is_not_hallucinated() {
        let dir = tempdir().unwrap();
        let outcome = ToolOutcome {
            exit_code: 1,
            ..Default::default()
        };
        assert!(guardrails().post_check(&task(None, &[]), &outcome, None, dir.path()).is_clean());
    }

    #[test]
    fn test_missing_outputs_and_failed_tests() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "x").unwrap();
        let t = task(None, &[]).with_meta("expected_outputs", json!(["present.txt", "missing.txt"]));
        let outcome = ToolOutcome {
            stdout: "{\"status\": \"success\", \"tests_run\": 10, \"tests_passed\": 9}".to_string(),
            ..Default::default()
        };
        let report = guardrails().post_check(&t, &outcome, None, dir.path());
        assert_eq!(report.violations.len(), 2);
        assert!(report.violations.iter().all(|v| v.kind == ViolationKind::HallucinatedSuccess));
    }

    #[test]
    fn test_change_limits_prefer_observed_changes() {
        let dir = tempdir().unwrap();
        let outcome = ToolOutcome {
            stdout: "{\"files_changed\": 1, \"lines_changed\": 1}".to_string(),
            ..Default::default()
        };
        let changes = ChangeSummary {
            files: vec!["src/a.rs".into(), "src/b.rs".into(), "src/c.rs".into()],
            lines_added: 20,
            lines_removed: 0,
            hunks: 3,
        };
        let report = guardrails().post_check(&task(Some("small_edit"), &[]), &outcome, Some(&changes), dir.path());
        assert_eq!(report.violations.len(), 2);
        assert!(report.has(ViolationKind::ChangeLimitExceeded));
        assert!(!report.is_blocked());

        let report = guardrails().post_check(&task(Some("small_edit"), &[]), &outcome, None, dir.path());
        assert!(report.is_clean());
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let err = PatternRegistry::from_yaml("patterns:\n  bad:\n    include: [\"src/[\"]\n").unwrap_err();
        assert!(matches!(err, GuardrailError::InvalidGlob { .. }));
    }

    #[test]
    fn test_normalize_resolves_dot_segments() {
        assert_eq!(normalize("./src/lib.rs").as_deref(), Some("src/lib.rs"));
        assert_eq!(normalize("src//./a/../b.rs").as_deref(), Some("src/b.rs"));
        assert_eq!(normalize("src/../../etc/passwd"), None);
        assert_eq!(normalize("/etc/passwd"), None);
    }

    #[test]
    fn test_dot_dot_cannot_dodge_protected_paths() {
        let report = guardrails().pre_check(&task(Some("small_edit"), &["src/../secrets/key.pem"]), "aider");
        assert!(report.has(ViolationKind::ProtectedPath));
        assert!(report.is_blocked());

        let report = guardrails().pre_check(&task(Some("small_edit"), &["src/../../outside.rs"]), "aider");
        assert!(report.has(ViolationKind::PathEscapesWorktree));
        assert!(report.is_blocked());
    }

    fn changed(files: &[&str]) -> ChangeSummary {
        ChangeSummary {
            files: files.iter().map(|f| f.to_string()).collect(),
            lines_added: 1,
            lines_removed: 0,
            hunks: 1,
        }
    }

    #[test]
    fn test_undeclared_writes_are_checked() {
        let dir = tempdir().unwrap();
        let t = task(Some("small_edit"), &["src/a.rs"]);
        let outcome = ToolOutcome::default();

        let report = guardrails().post_check(&t, &outcome, Some(&changed(&["src/a.rs", "secrets/key.pem"])), dir.path());
        assert!(report.has(ViolationKind::ProtectedPath));
        assert!(report.is_blocked());

        let report = guardrails().post_check(&t, &outcome, Some(&changed(&["src/generated/x.rs"])), dir.path());
        assert!(report.has(ViolationKind::PathExcluded));
        assert!(report.is_blocked());

        let report = guardrails().post_check(&t, &outcome, Some(&changed(&["docs/notes.md"])), dir.path());
        assert!(report.has(ViolationKind::PathOutOfScope));
        assert!(!report.is_blocked());

        // Legacy tasks still may not touch protected paths
        let report = guardrails().post_check(&task(None, &[]), &outcome, Some(&changed(&["secrets/a"])), dir.path());
        assert!(report.is_blocked());
    }

    #[test]
    fn test_default_registry_still_catches_hallucinated_success() {
        let dir = tempdir().unwrap();
        let guardrails = PatternGuardrails::new(PatternRegistry::default());
        let outcome = ToolOutcome {
            stdout: "{\"status\": \"completed\", \"tests_run\": 3, \"tests_passed\": 1}".to_string(),
            ..Default::default()
        };
        let report = guardrails.post_check(&task(None, &[]), &outcome, None, dir.path());
        assert!(report.has(ViolationKind::HallucinatedSuccess));
        assert!(report.is_blocked());
    }
}
