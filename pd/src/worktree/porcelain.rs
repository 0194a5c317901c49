//! Parser for `git worktree list --porcelain`

use std::path::PathBuf;

/// One record of the porcelain listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PorcelainEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name (`refs/heads/` stripped)
    pub branch: Option<String>,
    pub detached: bool,
    pub bare: bool,
    pub locked: bool,
    pub prunable: bool,
}

/// Parse the blank-line separated records
pub fn parse_worktree_list(output: &str) -> Vec<PorcelainEntry> {
    let mut entries = Vec::new();
    let mut current: Option<PorcelainEntry> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        let (key, value) = match line.split_once(' ') {
            Some((k, v)) => (k, Some(v)),
            None => (line, None),
        };
        if key == "worktree" {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(PorcelainEntry {
                path: PathBuf::from(value.unwrap_or_default()),
                ..Default::default()
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        match key {
            "HEAD" => entry.head = value.map(str::to_string),
            "branch" => {
                entry.branch = value.map(|b| b.strip_prefix("refs/heads/").unwrap_or(b).to_string());
            }
            "detached" => entry.detached = true,
            "bare" => entry.bare = true,
            "locked" => entry.locked = true,
            "prunable" => entry.prunable = true,
            _ => {}
        }
    }
    if let Some(entry) = current {
        entries.push(entry);
    }
    entries
}
