//! Tool adapters: how a routed tool is actually invoked
//!
//! Every failure mode (timeout, missing binary, bad working directory, empty
//! command) converges to a [`ToolOutcome`] with a synthetic exit code.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::router::RouterConfig;

/// Exit code reported when the tool exceeded its timeout
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when the working directory is unusable
pub const EXIT_BAD_CWD: i32 = 126;
/// Exit code reported when the tool binary cannot be found
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code reported when no command is configured
pub const EXIT_EMPTY_COMMAND: i32 = 2;

/// Fixed set of adapter kinds, resolved once at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Shell out to the tool's command template
    #[default]
    Subprocess,
    /// Succeed without doing anything (dry runs)
    Noop,
}

/// Everything an adapter needs to invoke one tool for one task
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub run_id: String,
    pub task_id: String,
    pub task_kind: String,
    pub tool_id: String,
    /// Command template from the tool's `apps` entry
    pub command: Option<String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub metadata: Value,
}

impl ToolRequest {
    fn template_context(&self) -> Value {
        json!({
            "cwd": self.cwd.to_string_lossy(),
            "run_id": self.run_id,
            "task_id": self.task_id,
            "task_kind": self.task_kind,
            "tool_id": self.tool_id,
            "metadata": self.metadata,
        })
    }
}

/// Structured result of one tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    fn synthetic(exit_code: i32, message: impl Into<String>, started: Instant) -> Self {
        Self {
            exit_code,
            stderr: message.into(),
            duration_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        }
    }

    /// The last stdout line that parses as a JSON object
    pub fn report_json(&self) -> Option<Value> {
        self.stdout
            .lines()
            .rev()
            .map(str::trim)
            .filter(|l| l.starts_with('{'))
            .find_map(|l| serde_json::from_str::<Value>(l).ok().filter(Value::is_object))
    }
}

/// Invokes a tool for a task
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Never fails: problems become non-zero exit codes
    async fn invoke(&self, request: &ToolRequest) -> ToolOutcome;
}

/// Build the adapter for a kind
pub fn create_adapter(kind: AdapterKind) -> Arc<dyn ToolAdapter> {
    debug!(?kind, "create_adapter: called");
    match kind {
        AdapterKind::Subprocess => Arc::new(SubprocessAdapter::new()),
        AdapterKind::Noop => Arc::new(NoopAdapter),
    }
}

/// Resolve one adapter per configured tool
pub fn resolve_adapters(config: &RouterConfig) -> BTreeMap<String, Arc<dyn ToolAdapter>> {
    let mut by_kind: HashMap<AdapterKind, Arc<dyn ToolAdapter>> = HashMap::new();
    let mut adapters = BTreeMap::new();
    for (tool_id, app) in &config.apps {
        let adapter = by_kind.entry(app.adapter).or_insert_with(|| create_adapter(app.adapter)).clone();
        adapters.insert(tool_id.clone(), adapter);
    }
    debug!(count = adapters.len(), "resolve_adapters: resolved");
    adapters
}

/// Runs the rendered command template through `sh -c`
pub struct SubprocessAdapter {
    templates: Handlebars<'static>,
}

impl Default for SubprocessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessAdapter {
    pub fn new() -> Self {
        let mut templates = Handlebars::new();
        // Commands are shell text, not HTML; `{{{raw}}}` bypasses quoting
        templates.register_escape_fn(shell_quote);
        Self { templates }
    }

    fn render(&self, request: &ToolRequest, template: &str) -> Result<String, String> {
        self.templates
            .render_template(template, &request.template_context())
            .map_err(|e| format!("Failed to render command template: {}", e))
    }
}

#[async_trait]
impl ToolAdapter for SubprocessAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Subprocess
    }

    async fn invoke(&self, request: &ToolRequest) -> ToolOutcome {
        debug!(tool_id = %request.tool_id, task_id = %request.task_id, "SubprocessAdapter::invoke: called");
        let started = Instant::now();

        let template = request.command.as_deref().unwrap_or("").trim();
        if template.is_empty() {
            warn!(tool_id = %request.tool_id, "Tool has no command configured");
            return ToolOutcome::synthetic(EXIT_EMPTY_COMMAND, "empty command", started);
        }
        if !request.cwd.is_dir() {
            warn!(cwd = ?request.cwd, "Tool working directory is not a directory");
            return ToolOutcome::synthetic(
                EXIT_BAD_CWD,
                format!("invalid working directory: {}", request.cwd.display()),
                started,
            );
        }
        let command = match self.render(request, template) {
            Ok(c) if !c.trim().is_empty() => c,
            Ok(_) => return ToolOutcome::synthetic(EXIT_EMPTY_COMMAND, "empty command", started),
            Err(e) => return ToolOutcome::synthetic(EXIT_EMPTY_COMMAND, e, started),
        };
        debug!(%command, "SubprocessAdapter::invoke: running");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&request.cwd)
            .env("PD_RUN_ID", &request.run_id)
            .env("PD_TASK_ID", &request.task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ToolOutcome::synthetic(EXIT_NOT_FOUND, format!("shell not found: {}", e), started);
            }
            Err(e) => return ToolOutcome::synthetic(EXIT_BAD_CWD, e.to_string(), started),
        };

        // Dropping the wait future on timeout kills the child
        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let outcome = ToolOutcome {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    timed_out: false,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                info!(tool_id = %request.tool_id, task_id = %request.task_id, exit_code = outcome.exit_code, duration_ms = outcome.duration_ms, "Tool finished");
                outcome
            }
            Ok(Err(e)) => ToolOutcome::synthetic(-1, format!("failed to collect tool output: {}", e), started),
            Err(_) => {
                warn!(tool_id = %request.tool_id, task_id = %request.task_id, timeout = ?request.timeout, "Tool timed out");
                ToolOutcome {
                    timed_out: true,
                    ..ToolOutcome::synthetic(
                        EXIT_TIMEOUT,
                        format!("timed out after {}s", request.timeout.as_secs_f64()),
                        started,
                    )
                }
            }
        }
    }
}

/// Quote `value` as one POSIX shell word; plain words pass through unchanged
fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@,+%".contains(c));
    if plain {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Always succeeds without touching anything
pub struct NoopAdapter;

#[async_trait]
impl ToolAdapter for NoopAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Noop
    }

    async fn invoke(&self, request: &ToolRequest) -> ToolOutcome {
        debug!(tool_id = %request.tool_id, task_id = %request.task_id, "NoopAdapter::invoke: called");
        ToolOutcome::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(command: Option<&str>, cwd: PathBuf) -> ToolRequest {
        ToolRequest {
            run_id: "run-1".to_string(),
            task_id: "task-1".to_string(),
            task_kind: "code_edit".to_string(),
            tool_id: "shell".to_string(),
            command: command.map(str::to_string),
            cwd,
            timeout: Duration::from_secs(10),
            metadata: json!({"target": "a & b"}),
        }
    }

    #[tokio::test]
    async fn test_placeholders_are_rendered() {
        let dir = tempdir().unwrap();
        let adapter = SubprocessAdapter::new();
        let req = request(Some("echo {{task_id}} {{metadata.target}} && pwd"), dir.path().to_path_buf());
        let outcome = adapter.invoke(&req).await;

        assert_eq!(outcome.exit_code, 0);
        let mut lines = outcome.stdout.lines();
        assert_eq!(lines.next(), Some("task-1 a & b"));
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(lines.next().map(PathBuf::from), Some(cwd));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("task-1"), "task-1");
        assert_eq!(shell_quote("src/a.rs"), "src/a.rs");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a & b"), "'a & b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_metadata_cannot_inject_shell_commands() {
        let dir = tempdir().unwrap();
        let mut req = request(Some("echo {{metadata.target}}"), dir.path().to_path_buf());
        req.metadata = json!({"target": "$(touch pwned); `touch pwned2` 'x' \"y\""});
        let outcome = SubprocessAdapter::new().invoke(&req).await;

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "$(touch pwned); `touch pwned2` 'x' \"y\"");
        assert!(!dir.path().join("pwned").exists());
        assert!(!dir.path().join("pwned2").exists());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_reported() {
        let dir = tempdir().unwrap();
        let outcome = SubprocessAdapter::new()
            .invoke(&request(Some("echo bad >&2; exit 3"), dir.path().to_path_buf()))
            .await;
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
        assert_eq!(outcome.stderr.trim(), "bad");
    }

    #[tokio::test]
    async fn test_timeout_is_synthetic_exit() {
        let dir = tempdir().unwrap();
        let mut req = request(Some("sleep 10"), dir.path().to_path_buf());
        req.timeout = Duration::from_millis(100);
        let outcome = SubprocessAdapter::new().invoke(&req).await;
        assert_eq!(outcome.exit_code, EXIT_TIMEOUT);
        assert!(outcome.timed_out);
        assert!(outcome.duration_ms < 5000);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempdir().unwrap();
        let outcome = SubprocessAdapter::new()
            .invoke(&request(Some("definitely-not-a-real-tool-xyz"), dir.path().to_path_buf()))
            .await;
        assert_eq!(outcome.exit_code, EXIT_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_cwd_and_empty_command() {
        let dir = tempdir().unwrap();
        let adapter = SubprocessAdapter::new();

        let outcome = adapter
            .invoke(&request(Some("true"), dir.path().join("missing")))
            .await;
        assert_eq!(outcome.exit_code, EXIT_BAD_CWD);

        let outcome = adapter.invoke(&request(None, dir.path().to_path_buf())).await;
        assert_eq!(outcome.exit_code, EXIT_EMPTY_COMMAND);
        let outcome = adapter.invoke(&request(Some("   "), dir.path().to_path_buf())).await;
        assert_eq!(outcome.exit_code, EXIT_EMPTY_COMMAND);
    }

    #[tokio::test]
    async fn test_noop_adapter() {
        let adapter = create_adapter(AdapterKind::Noop);
        assert_eq!(adapter.kind(), AdapterKind::Noop);
        let outcome = adapter.invoke(&request(None, PathBuf::from("/nowhere"))).await;
        assert!(outcome.success());
    }

    #[test]
    fn test_report_json_uses_last_object_line() {
        let outcome = ToolOutcome {
            stdout: "{\"status\": \"early\"}\nworking...\n{\"status\": \"completed\"}\n[1, 2]\n".to_string(),
            ..Default::default()
        };
        assert_eq!(outcome.report_json().unwrap()["status"], "completed");
        assert!(ToolOutcome::default().report_json().is_none());
    }

    #[test]
    fn test_adapter_kind_serde() {
        let kind: AdapterKind = serde_yaml::from_str("noop").unwrap();
        assert_eq!(kind, AdapterKind::Noop);
        assert_eq!(AdapterKind::default(), AdapterKind::Subprocess);
    }
}
