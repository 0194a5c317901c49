//! Task router
//!
//! Maps a task (kind, risk tier, complexity, domain) to a concrete tool using
//! ordered rules, a per-rule strategy and historical metrics.

mod config;
mod core;
mod state;

pub use config::{
    AppConfig, Capabilities, DEFAULT_TIMEOUT_SECONDS, MatchValue, RouterConfig, RouterDefaults, RoutingRule,
    RoutingSection, RuleMatch, Strategy, ToolLimits, ToolProfiles,
};
pub use self::core::{FALLBACK_STRATEGY, PROFILE_STRATEGY, RouteRequest, RoutingDecision, TaskRouter};
pub use state::{FileStateStore, InMemoryStateStore, NEUTRAL_SCORE, RouterState, StateStore, ToolMetrics};

/// Router errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Router configuration error: {0}")]
    Config(String),

    #[error("No capable tool for task kind {task_kind}")]
    NoCapableTool { task_kind: String },

    #[error("Router state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Router state serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Router document parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
