//! Router configuration and tool profiles documents

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RouterError;
use crate::executor::AdapterKind;

/// Default tool timeout when neither the tool nor `defaults` set one
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

/// Tool selection strategy for a routing rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Always the first candidate
    #[default]
    Fixed,
    /// Rotate through candidates with a persisted cursor
    RoundRobin,
    /// Highest historical score
    Metrics,
    /// Same as metrics
    Auto,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::RoundRobin => write!(f, "round_robin"),
            Self::Metrics => write!(f, "metrics"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// A match value: one string or a list; `*` matches anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchValue {
    One(String),
    Many(Vec<String>),
}

impl MatchValue {
    /// A missing task attribute only satisfies a wildcard
    pub fn matches(&self, value: Option<&str>) -> bool {
        let accepts = |candidate: &str| candidate == "*" || Some(candidate) == value;
        match self {
            Self::One(s) => accepts(s),
            Self::Many(items) => items.iter().any(|s| accepts(s)),
        }
    }
}

/// Predicate of a routing rule; absent keys match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleMatch {
    pub task_kind: Option<MatchValue>,
    pub risk_tier: Option<MatchValue>,
    pub complexity: Option<MatchValue>,
}

impl RuleMatch {
    pub fn matches(&self, task_kind: &str, risk_tier: Option<&str>, complexity: Option<&str>) -> bool {
        let check = |m: &Option<MatchValue>, v: Option<&str>| m.as_ref().is_none_or(|m| m.matches(v));
        check(&self.task_kind, Some(task_kind)) && check(&self.risk_tier, risk_tier) && check(&self.complexity, complexity)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    #[serde(rename = "match", default)]
    pub matcher: RuleMatch,
    #[serde(default)]
    pub select_from: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub task_kinds: Vec<String>,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLimits {
    pub max_parallel: usize,
    pub timeout_seconds: Option<u64>,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            timeout_seconds: None,
        }
    }
}

/// One external tool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capabilities: Capabilities,
    /// Handlebars template run through `sh -c`
    pub command: Option<String>,
    pub adapter: AdapterKind,
    pub limits: ToolLimits,
}

impl AppConfig {
    pub fn supports(&self, task_kind: &str, domain: Option<&str>) -> bool {
        if !self.capabilities.task_kinds.iter().any(|k| k == task_kind) {
            return false;
        }
        match domain {
            Some(d) => self.capabilities.domains.iter().any(|x| x == d),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterDefaults {
    pub timeout_seconds: u64,
}

impl Default for RouterDefaults {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

/// The router configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub apps: BTreeMap<String, AppConfig>,
    pub routing: RoutingSection,
    pub defaults: RouterDefaults,
}

impl RouterConfig {
    /// Parse YAML (JSON is accepted too)
    pub fn from_yaml(content: &str) -> Result<Self, RouterError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, RouterError> {
        debug!(?path, "RouterConfig::load: called");
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Rules may only select declared tools, and rule ids must be unique
    fn check(&self) -> Result<(), RouterError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &self.routing.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(RouterError::Config(format!("Duplicate rule id: {}", rule.id)));
            }
            for tool in &rule.select_from {
                if !self.apps.contains_key(tool) {
                    return Err(RouterError::Config(format!(
                        "Rule {} selects unknown tool {}",
                        rule.id, tool
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn app(&self, tool_id: &str) -> Option<&AppConfig> {
        self.apps.get(tool_id)
    }

    /// Effective invocation timeout for a tool
    pub fn timeout_for(&self, tool_id: &str) -> Duration {
        let secs = self
            .apps
            .get(tool_id)
            .and_then(|a| a.limits.timeout_seconds)
            .unwrap_or(self.defaults.timeout_seconds);
        Duration::from_secs(secs)
    }

    pub fn max_parallel_for(&self, tool_id: &str) -> usize {
        self.apps.get(tool_id).map(|a| a.limits.max_parallel.max(1)).unwrap_or(1)
    }
}

/// operation_kind -> tool_id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolProfiles {
    pub profiles: BTreeMap<String, String>,
}

impl ToolProfiles {
    pub fn from_yaml(content: &str) -> Result<Self, RouterError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, RouterError> {
        debug!(?path, "ToolProfiles::load: called");
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    pub fn tool_for(&self, operation_kind: &str) -> Option<&str> {
        self.profiles.get(operation_kind).map(String::as_str)
    }
}
