//! Event vocabulary of the patch daemon

use serde::{Deserialize, Serialize};

use crate::domain::EventRecord;
use crate::router::RoutingDecision;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PdEvent {
    // === Lifecycle ===
    RunStateChanged {
        run_id: String,
        from: String,
        to: String,
    },
    TaskStateChanged {
        run_id: String,
        task_id: String,
        from: String,
        to: String,
    },
    PatchStateChanged {
        run_id: String,
        ledger_id: String,
        from: String,
        to: String,
    },

    // === Routing & execution ===
    RoutingDecided {
        run_id: Option<String>,
        decision: RoutingDecision,
    },
    ToolCompleted {
        run_id: String,
        task_id: String,
        tool_id: String,
        exit_code: i32,
        timed_out: bool,
        duration_ms: u64,
    },

    // === Safety ===
    GuardrailViolation {
        run_id: String,
        task_id: String,
        kind: String,
        severity: String,
        message: String,
    },
    LoopDetected {
        run_id: String,
        kind: String,
        task_id: Option<String>,
        count: u32,
    },

    // === Errors ===
    Error {
        run_id: String,
        context: String,
        message: String,
    },
}

impl PdEvent {
    /// Run this event belongs to, if any
    pub fn run_id(&self) -> Option<&str> {
        match self {
            PdEvent::RunStateChanged { run_id, .. }
            | PdEvent::TaskStateChanged { run_id, .. }
            | PdEvent::PatchStateChanged { run_id, .. }
            | PdEvent::ToolCompleted { run_id, .. }
            | PdEvent::GuardrailViolation { run_id, .. }
            | PdEvent::LoopDetected { run_id, .. }
            | PdEvent::Error { run_id, .. } => Some(run_id),
            PdEvent::RoutingDecided { run_id, .. } => run_id.as_deref(),
        }
    }

    /// Snake-case kind stored with the persisted record
    pub fn event_type(&self) -> &'static str {
        match self {
            PdEvent::RunStateChanged { .. } => "run_state_changed",
            PdEvent::TaskStateChanged { .. } => "task_state_changed",
            PdEvent::PatchStateChanged { .. } => "patch_state_changed",
            PdEvent::RoutingDecided { .. } => "routing_decision",
            PdEvent::ToolCompleted { .. } => "tool_completed",
            PdEvent::GuardrailViolation { .. } => "guardrail_violation",
            PdEvent::LoopDetected { .. } => "loop_detected",
            PdEvent::Error { .. } => "error",
        }
    }

    /// Convert to the persisted form
    pub fn to_record(&self) -> EventRecord {
        let payload = serde_json::to_value(self).unwrap_or_default();
        EventRecord::new(self.run_id().map(str::to_string), self.event_type(), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_record() {
        let event = PdEvent::TaskStateChanged {
            run_id: "r1".to_string(),
            task_id: "A".to_string(),
            from: "ready".to_string(),
            to: "running".to_string(),
        };
        let record = event.to_record();
        assert_eq!(record.kind, "task_state_changed");
        assert_eq!(record.run_id.as_deref(), Some("r1"));
        assert_eq!(record.payload["type"], "TaskStateChanged");
        assert_eq!(record.payload["task_id"], "A");
    }
}
