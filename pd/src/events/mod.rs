//! Event bus for run observability
//!
//! Every state transition, routing decision and guardrail finding is emitted
//! on a `tokio::sync::broadcast` bus. The recorder subscribes and appends each
//! event to the `events` collection; the router's feedback channel is an
//! emitter on the same bus.

mod bus;
mod recorder;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, create_event_bus};
pub use recorder::{EventRecorder, spawn_event_recorder};
pub use types::PdEvent;
