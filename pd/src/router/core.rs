//! TaskRouter - rule evaluation, strategies and fallback

use patchstore::now_ms;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::RouterError;
use super::config::{RouterConfig, RoutingRule, Strategy, ToolProfiles};
use super::state::{StateStore, ToolMetrics};
use crate::domain::Task;
use crate::events::EventEmitter;

/// Strategy label for decisions made without a matching rule
pub const FALLBACK_STRATEGY: &str = "fallback";
/// Strategy label for tool-profile decisions
pub const PROFILE_STRATEGY: &str = "profile";

/// Attributes the router selects on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRequest {
    pub task_kind: String,
    pub risk_tier: Option<String>,
    pub complexity: Option<String>,
    pub domain: Option<String>,
    pub task_id: Option<String>,
    pub run_id: Option<String>,
}

impl RouteRequest {
    pub fn new(task_kind: impl Into<String>) -> Self {
        Self {
            task_kind: task_kind.into(),
            ..Default::default()
        }
    }

    pub fn for_task(task: &Task, run_id: Option<&str>) -> Self {
        Self {
            task_kind: task.task_kind.clone(),
            risk_tier: task.risk_tier().map(str::to_string),
            complexity: task.complexity().map(str::to_string),
            domain: task.domain().map(str::to_string),
            task_id: Some(task.task_id.clone()),
            run_id: run_id.map(str::to_string),
        }
    }
}

/// Append-only audit record, one per routing call that selected a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub task_kind: String,
    pub selected_tool: String,
    pub strategy: String,
    pub candidates: Vec<String>,
    pub rule_id: Option<String>,
    pub timestamp: i64,
    pub task_id: Option<String>,
    pub run_id: Option<String>,
}

/// Capability/strategy-based tool router
pub struct TaskRouter {
    config: RouterConfig,
    profiles: ToolProfiles,
    state: Box<dyn StateStore>,
    decisions: Vec<RoutingDecision>,
    feedback: Option<EventEmitter>,
}

impl TaskRouter {
    pub fn new(config: RouterConfig, state: Box<dyn StateStore>) -> Self {
        debug!(apps = config.apps.len(), rules = config.routing.rules.len(), "TaskRouter::new: called");
        Self {
            config,
            profiles: ToolProfiles::default(),
            state,
            decisions: Vec::new(),
            feedback: None,
        }
    }

    pub fn with_profiles(mut self, profiles: ToolProfiles) -> Self {
        self.profiles = profiles;
        self
    }

    /// Publish every decision on this emitter
    pub fn with_feedback(mut self, emitter: EventEmitter) -> Self {
        self.feedback = Some(emitter);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Audit log, oldest first
    pub fn decisions(&self) -> &[RoutingDecision] {
        &self.decisions
    }

    pub fn metrics(&self, tool_id: &str) -> ToolMetrics {
        self.state.metrics(tool_id)
    }

    /// Select a tool id, or None when nothing can handle the task
    pub fn route(
        &mut self,
        task_kind: &str,
        risk_tier: Option<&str>,
        complexity: Option<&str>,
        domain: Option<&str>,
    ) -> Option<String> {
        let request = RouteRequest {
            task_kind: task_kind.to_string(),
            risk_tier: risk_tier.map(str::to_string),
            complexity: complexity.map(str::to_string),
            domain: domain.map(str::to_string),
            ..Default::default()
        };
        self.route_request(&request).map(|d| d.selected_tool)
    }

    /// Full routing: rules in declaration order, then capability fallback
    pub fn route_request(&mut self, request: &RouteRequest) -> Option<RoutingDecision> {
        debug!(?request, "TaskRouter::route_request: called");
        let risk = request.risk_tier.as_deref();
        let complexity = request.complexity.as_deref();

        let matched = self
            .config
            .routing
            .rules
            .iter()
            .find(|rule| {
                !rule.select_from.is_empty() && rule.matcher.matches(&request.task_kind, risk, complexity)
            })
            .cloned();

        let decision = match matched {
            Some(rule) => {
                debug!(rule_id = %rule.id, strategy = %rule.strategy, "TaskRouter::route_request: rule matched");
                let selected = self.select(&rule);
                self.make_decision(request, selected, rule.strategy.to_string(), rule.select_from, Some(rule.id))
            }
            None => {
                debug!("TaskRouter::route_request: no rule matched, trying capability fallback");
                let capable = self.capable_tools(&request.task_kind, request.domain.as_deref());
                let Some(selected) = capable.first().cloned() else {
                    warn!(task_kind = %request.task_kind, domain = ?request.domain, "No capable tool for task");
                    return None;
                };
                self.make_decision(request, selected, FALLBACK_STRATEGY.to_string(), capable, None)
            }
        };
        self.record_decision(decision.clone());
        Some(decision)
    }

    /// Route a task: tool profile by operation kind first, then rules
    pub fn route_task(&mut self, task: &Task, run_id: Option<&str>) -> Result<RoutingDecision, RouterError> {
        debug!(task_id = %task.task_id, "TaskRouter::route_task: called");
        if let Some(op) = task.operation_kind()
            && let Some(tool) = self.profiles.tool_for(op).map(str::to_string)
        {
            debug!(%op, %tool, "TaskRouter::route_task: resolved by tool profile");
            let request = RouteRequest::for_task(task, run_id);
            let decision = self.make_decision(&request, tool.clone(), PROFILE_STRATEGY.to_string(), vec![tool], None);
            self.record_decision(decision.clone());
            return Ok(decision);
        }
        self.route_request(&RouteRequest::for_task(task, run_id))
            .ok_or_else(|| RouterError::NoCapableTool {
                task_kind: task.task_kind.clone(),
            })
    }

    /// Tool id for an operation kind from the tool profiles
    pub fn route_by_operation(&mut self, operation_kind: &str) -> Option<String> {
        debug!(%operation_kind, "TaskRouter::route_by_operation: called");
        let tool = self.profiles.tool_for(operation_kind)?.to_string();
        let request = RouteRequest::new(operation_kind);
        let decision = self.make_decision(&request, tool.clone(), PROFILE_STRATEGY.to_string(), vec![tool.clone()], None);
        self.record_decision(decision);
        Some(tool)
    }

    /// Update metrics for one finished task
    pub fn record_execution_result(&mut self, tool_id: &str, success: bool, latency_ms: u64) -> Result<(), RouterError> {
        debug!(%tool_id, success, latency_ms, "TaskRouter::record_execution_result: called");
        self.state.record(tool_id, success, latency_ms)
    }

    /// Persist buffered router state
    pub fn flush(&mut self) -> Result<(), RouterError> {
        debug!("TaskRouter::flush: called");
        self.state.flush()
    }

    /// Tools whose capabilities cover the kind (and domain), alphabetical
    pub fn capable_tools(&self, task_kind: &str, domain: Option<&str>) -> Vec<String> {
        // BTreeMap iteration is already alphabetical
        self.config
            .apps
            .iter()
            .filter(|(_, app)| app.supports(task_kind, domain))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn select(&mut self, rule: &RoutingRule) -> String {
        let candidates = &rule.select_from;
        match rule.strategy {
            Strategy::Fixed => candidates[0].clone(),
            Strategy::RoundRobin => match self.state.next_round_robin(&rule.id, candidates.len()) {
                Ok(index) => candidates[index].clone(),
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "Round-robin state unavailable, using first candidate");
                    candidates[0].clone()
                }
            },
            Strategy::Metrics | Strategy::Auto => {
                let mut best = &candidates[0];
                let mut best_score = self.state.metrics(best).score();
                for candidate in &candidates[1..] {
                    let score = self.state.metrics(candidate).score();
                    debug!(%candidate, score, "TaskRouter::select: scored");
                    // Strictly greater: ties keep the current best
                    if score > best_score {
                        best = candidate;
                        best_score = score;
                    }
                }
                best.clone()
            }
        }
    }

    fn make_decision(
        &self,
        request: &RouteRequest,
        selected_tool: String,
        strategy: String,
        candidates: Vec<String>,
        rule_id: Option<String>,
    ) -> RoutingDecision {
        RoutingDecision {
            task_kind: request.task_kind.clone(),
            selected_tool,
            strategy,
            candidates,
            rule_id,
            timestamp: now_ms(),
            task_id: request.task_id.clone(),
            run_id: request.run_id.clone(),
        }
    }

    fn record_decision(&mut self, decision: RoutingDecision) {
        info!(
            task_kind = %decision.task_kind,
            tool = %decision.selected_tool,
            strategy = %decision.strategy,
            rule_id = ?decision.rule_id,
            "Routing decision"
        );
        if let Some(ref emitter) = self.feedback {
            emitter.routing_decided(&decision);
        }
        self.decisions.push(decision);
    }
}
