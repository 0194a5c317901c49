//! Execution layer: tool adapters, guardrails, loop detection

mod adapter;
#[allow(clippy::module_inception)]
mod executor;
mod guardrails;
mod loop_detector;

pub use adapter::{
    AdapterKind, EXIT_BAD_CWD, EXIT_EMPTY_COMMAND, EXIT_NOT_FOUND, EXIT_TIMEOUT, NoopAdapter, SubprocessAdapter,
    ToolAdapter, ToolOutcome, ToolRequest, create_adapter, resolve_adapters,
};
pub use executor::{EXIT_NOT_RUN, ExecutionResult, ExecutionStatus, Executor};
pub use guardrails::{
    ChangeLimits, CheckReport, GuardrailError, Guardrails, Pattern, PatternGuardrails, PatternRegistry, Severity,
    ToolReport, Violation, ViolationKind,
};
pub use loop_detector::{
    DEFAULT_LOOP_THRESHOLD, Gap, LoopDetector, LoopSignal, PlanningMitigation, Workstream, mitigate_planning_loop,
};
