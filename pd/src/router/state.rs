//! Router state: round-robin cursors and per-tool metrics
//!
//! Routing state is advisory. The file-backed store flushes at most every
//! `flush_every` updates, so a crash can lose the last few decisions.
//! Flushes merge this process's buffered deltas into whatever is on disk, so
//! concurrent runs sharing one file add up instead of overwriting each other.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::RouterError;

/// Counters for one tool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_latency_ms: u64,
}

/// Score given to tools with no history
pub const NEUTRAL_SCORE: f64 = 0.5;

impl ToolMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.call_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.call_count as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.call_count == 0 {
            return 0.0;
        }
        self.total_latency_ms as f64 / self.call_count as f64
    }

    /// `0.7 * success_rate + 0.3 * 1/(1 + avg_latency_s)`; untried tools are neutral
    pub fn score(&self) -> f64 {
        if self.call_count == 0 {
            return NEUTRAL_SCORE;
        }
        let latency_score = 1.0 / (1.0 + self.avg_latency_ms() / 1000.0);
        0.7 * self.success_rate() + 0.3 * latency_score
    }

    fn record(&mut self, success: bool, latency_ms: u64) {
        self.call_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.total_latency_ms = self.total_latency_ms.saturating_add(latency_ms);
    }

    fn merge(&mut self, other: &ToolMetrics) {
        self.call_count += other.call_count;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.total_latency_ms = self.total_latency_ms.saturating_add(other.total_latency_ms);
    }
}

/// Serialized router state (the on-disk JSON document)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterState {
    pub round_robin: BTreeMap<String, usize>,
    pub metrics: BTreeMap<String, ToolMetrics>,
}

impl RouterState {
    /// Current cursor for a rule, then advance it by one (mod `len`)
    fn advance(&mut self, rule_id: &str, len: usize) -> usize {
        let cursor = self.round_robin.entry(rule_id.to_string()).or_insert(0);
        let selected = *cursor % len;
        *cursor = (selected + 1) % len;
        selected
    }
}

/// Backing store for router state
pub trait StateStore: Send {
    /// Index to use for this call of a round-robin rule; advances the cursor
    fn next_round_robin(&mut self, rule_id: &str, len: usize) -> Result<usize, RouterError>;

    fn metrics(&self, tool_id: &str) -> ToolMetrics;

    /// Record one completed execution
    fn record(&mut self, tool_id: &str, success: bool, latency_ms: u64) -> Result<(), RouterError>;

    /// Persist buffered updates
    fn flush(&mut self) -> Result<(), RouterError>;

    fn snapshot(&self) -> RouterState;
}

/// Process-local store for tests and dry runs
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: RouterState,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RouterState) -> Self {
        Self { state }
    }
}

impl StateStore for InMemoryStateStore {
    fn next_round_robin(&mut self, rule_id: &str, len: usize) -> Result<usize, RouterError> {
        Ok(self.state.advance(rule_id, len))
    }

    fn metrics(&self, tool_id: &str) -> ToolMetrics {
        self.state.metrics.get(tool_id).copied().unwrap_or_default()
    }

    fn record(&mut self, tool_id: &str, success: bool, latency_ms: u64) -> Result<(), RouterError> {
        self.state
            .metrics
            .entry(tool_id.to_string())
            .or_default()
            .record(success, latency_ms);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), RouterError> {
        Ok(())
    }

    fn snapshot(&self) -> RouterState {
        self.state.clone()
    }
}

/// Cursor moves made since the last flush
#[derive(Debug, Clone, Copy)]
struct CursorAdvance {
    steps: usize,
    len: usize,
}

/// JSON file store with batched writes
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: RouterState,
    metric_deltas: BTreeMap<String, ToolMetrics>,
    cursor_advances: BTreeMap<String, CursorAdvance>,
    pending_updates: usize,
    flush_every: usize,
}

impl FileStateStore {
    /// Open the state file, starting empty if it does not exist or is unreadable
    pub fn open(path: impl Into<PathBuf>, flush_every: usize) -> Self {
        let path = path.into();
        debug!(?path, flush_every, "FileStateStore::open: called");
        let state = read_state(&path);
        Self {
            path,
            state,
            metric_deltas: BTreeMap::new(),
            cursor_advances: BTreeMap::new(),
            pending_updates: 0,
            flush_every: flush_every.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates buffered since the last flush
    pub fn pending_updates(&self) -> usize {
        self.pending_updates
    }

    fn mark_dirty(&mut self) -> Result<(), RouterError> {
        self.pending_updates += 1;
        if self.pending_updates >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Apply buffered deltas on top of `base`
    fn merged_onto(&self, mut base: RouterState) -> RouterState {
        for (tool_id, delta) in &self.metric_deltas {
            base.metrics.entry(tool_id.clone()).or_default().merge(delta);
        }
        for (rule_id, advance) in &self.cursor_advances {
            let cursor = base.round_robin.entry(rule_id.clone()).or_insert(0);
            *cursor = (*cursor % advance.len + advance.steps) % advance.len;
        }
        base
    }

    /// Re-read, merge and replace the file while holding the sidecar lock
    fn write_merged(&mut self) -> Result<(), RouterError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        // Run processes share one state file; serialize writers on a sidecar lock
        let lock_path = self.path.with_extension("lock");
        let lock = OpenOptions::new().create(true).truncate(false).write(true).open(&lock_path)?;
        lock.lock_exclusive()?;

        let merged = self.merged_onto(read_state(&self.path));
        let result = write_atomic(&self.path, &merged);
        let _ = FileExt::unlock(&lock);
        result?;

        self.state = merged;
        self.metric_deltas.clear();
        self.cursor_advances.clear();
        Ok(())
    }
}

/// Missing files start empty; corrupt ones are logged and start empty
fn read_state(path: &Path) -> RouterState {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(?path, error = %e, "Corrupt router state file, starting fresh");
                RouterState::default()
            }
        },
        Err(_) => RouterState::default(),
    }
}

fn write_atomic(path: &Path, state: &RouterState) -> Result<(), RouterError> {
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

impl StateStore for FileStateStore {
    fn next_round_robin(&mut self, rule_id: &str, len: usize) -> Result<usize, RouterError> {
        let selected = self.state.advance(rule_id, len);
        let advance = self
            .cursor_advances
            .entry(rule_id.to_string())
            .or_insert(CursorAdvance { steps: 0, len });
        advance.steps += 1;
        advance.len = len;
        self.mark_dirty()?;
        Ok(selected)
    }

    fn metrics(&self, tool_id: &str) -> ToolMetrics {
        self.state.metrics.get(tool_id).copied().unwrap_or_default()
    }

    fn record(&mut self, tool_id: &str, success: bool, latency_ms: u64) -> Result<(), RouterError> {
        self.state
            .metrics
            .entry(tool_id.to_string())
            .or_default()
            .record(success, latency_ms);
        self.metric_deltas
            .entry(tool_id.to_string())
            .or_default()
            .record(success, latency_ms);
        self.mark_dirty()
    }

    fn flush(&mut self) -> Result<(), RouterError> {
        if self.pending_updates == 0 && self.path.exists() {
            return Ok(());
        }
        debug!(path = ?self.path, pending = self.pending_updates, "FileStateStore::flush: writing");
        self.write_merged()?;
        self.pending_updates = 0;
        info!(path = ?self.path, "Router state flushed");
        Ok(())
    }

    fn snapshot(&self) -> RouterState {
        self.state.clone()
    }
}

impl Drop for FileStateStore {
    fn drop(&mut self) {
        if self.pending_updates > 0
            && let Err(e) = self.flush()
        {
            warn!(path = ?self.path, error = %e, "Failed to flush router state on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_score_formula() {
        let perfect_fast = ToolMetrics {
            call_count: 10,
            success_count: 10,
            failure_count: 0,
            total_latency_ms: 1000,
        };
        // 0.7 * 1.0 + 0.3 * 1/(1 + 0.1)
        assert!((perfect_fast.score() - (0.7 + 0.3 / 1.1)).abs() < 1e-9);
        assert_eq!(ToolMetrics::default().score(), NEUTRAL_SCORE);
        assert!(perfect_fast.score() > ToolMetrics::default().score());
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut store = InMemoryStateStore::new();
        let picks: Vec<usize> = (0..6).map(|_| store.next_round_robin("r", 3).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_cursor_survives_shrinking_candidate_list() {
        let mut state = RouterState::default();
        state.round_robin.insert("r".to_string(), 5);
        let mut store = InMemoryStateStore::with_state(state);
        assert_eq!(store.next_round_robin("r", 2).unwrap(), 1);
        assert_eq!(store.next_round_robin("r", 2).unwrap(), 0);
    }

    #[test]
    fn test_file_store_batches_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("router_state.json");
        let mut store = FileStateStore::open(&path, 3);

        store.record("aider", true, 100).unwrap();
        store.record("aider", false, 300).unwrap();
        assert!(!path.exists());
        assert_eq!(store.pending_updates(), 2);

        store.record("aider", true, 200).unwrap();
        assert!(path.exists());
        assert_eq!(store.pending_updates(), 0);

        let reloaded = FileStateStore::open(&path, 3);
        let m = reloaded.metrics("aider");
        assert_eq!(m.call_count, 3);
        assert_eq!(m.success_count, 2);
        assert_eq!(m.failure_count, 1);
        assert_eq!(m.total_latency_ms, 600);
    }

    #[test]
    fn test_file_store_flushes_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let mut store = FileStateStore::open(&path, 100);
            store.next_round_robin("rule-1", 3).unwrap();
        }
        let mut store = FileStateStore::open(&path, 100);
        assert_eq!(store.next_round_robin("rule-1", 3).unwrap(), 1);
    }

    #[test]
    fn test_concurrent_stores_merge_instead_of_overwriting() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut first = FileStateStore::open(&path, 100);
        let mut second = FileStateStore::open(&path, 100);

        first.record("aider", true, 100).unwrap();
        assert_eq!(first.next_round_robin("r", 3).unwrap(), 0);
        second.record("aider", false, 200).unwrap();
        second.record("codex", true, 50).unwrap();
        assert_eq!(second.next_round_robin("r", 3).unwrap(), 0);

        first.flush().unwrap();
        second.flush().unwrap();

        // The later flush sees the earlier one's work
        let m = second.metrics("aider");
        assert_eq!((m.call_count, m.success_count, m.failure_count), (2, 1, 1));
        assert_eq!(m.total_latency_ms, 300);

        let mut reloaded = FileStateStore::open(&path, 100);
        assert_eq!(reloaded.metrics("aider").call_count, 2);
        assert_eq!(reloaded.metrics("codex").call_count, 1);
        assert_eq!(reloaded.next_round_robin("r", 3).unwrap(), 2);

        // Flushing again without new work adds nothing
        first.flush().unwrap();
        assert_eq!(FileStateStore::open(&path, 100).metrics("aider").call_count, 2);
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        let store = FileStateStore::open(&path, 1);
        assert_eq!(store.snapshot(), RouterState::default());
    }
}
