//! Event Bus - pub/sub for patch daemon events

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::PdEvent;
use crate::router::RoutingDecision;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4_096;

/// Central event bus
///
/// Emitting is fire-and-forget: with no subscribers the event is dropped, and
/// a lagging subscriber loses the oldest events.
pub struct EventBus {
    tx: broadcast::Sender<PdEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn emit(&self, event: PdEvent) {
        debug!(event_type = event.event_type(), run_id = ?event.run_id(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<PdEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Emitter bound to one run
    pub fn emitter_for(&self, run_id: impl Into<String>) -> EventEmitter {
        let run_id = run_id.into();
        debug!(%run_id, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            tx: self.tx.clone(),
            run_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Cheap-to-clone handle with a pre-set run id
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<PdEvent>,
    run_id: String,
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter").field("run_id", &self.run_id).finish()
    }
}

impl EventEmitter {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, event: PdEvent) {
        debug!(event_type = event.event_type(), "EventEmitter::emit");
        let _ = self.tx.send(event);
    }

    // === Convenience methods ===

    pub fn run_state_changed(&self, from: impl ToString, to: impl ToString) {
        self.emit(PdEvent::RunStateChanged {
            run_id: self.run_id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    pub fn task_state_changed(&self, task_id: &str, from: impl ToString, to: impl ToString) {
        self.emit(PdEvent::TaskStateChanged {
            run_id: self.run_id.clone(),
            task_id: task_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    pub fn patch_state_changed(&self, ledger_id: &str, from: impl ToString, to: impl ToString) {
        self.emit(PdEvent::PatchStateChanged {
            run_id: self.run_id.clone(),
            ledger_id: ledger_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    pub fn routing_decided(&self, decision: &RoutingDecision) {
        self.emit(PdEvent::RoutingDecided {
            run_id: decision.run_id.clone().or_else(|| Some(self.run_id.clone())),
            decision: decision.clone(),
        });
    }

    pub fn tool_completed(&self, task_id: &str, tool_id: &str, exit_code: i32, timed_out: bool, duration_ms: u64) {
        self.emit(PdEvent::ToolCompleted {
            run_id: self.run_id.clone(),
            task_id: task_id.to_string(),
            tool_id: tool_id.to_string(),
            exit_code,
            timed_out,
            duration_ms,
        });
    }

    pub fn guardrail_violation(&self, task_id: &str, kind: &str, severity: &str, message: &str) {
        self.emit(PdEvent::GuardrailViolation {
            run_id: self.run_id.clone(),
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            severity: severity.to_string(),
            message: message.to_string(),
        });
    }

    pub fn loop_detected(&self, kind: &str, task_id: Option<&str>, count: u32) {
        self.emit(PdEvent::LoopDetected {
            run_id: self.run_id.clone(),
            kind: kind.to_string(),
            task_id: task_id.map(str::to_string),
            count,
        });
    }

    pub fn error(&self, context: &str, message: &str) {
        self.emit(PdEvent::Error {
            run_id: self.run_id.clone(),
            context: context.to_string(),
            message: message.to_string(),
        });
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
