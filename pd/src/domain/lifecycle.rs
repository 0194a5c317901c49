//! Closed state machines shared by every persisted entity
//!
//! Each status enum lists its legal successors in one `match`, so adding a
//! variant without deciding its transitions fails to compile.

use std::fmt::Display;

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {entity} transition for {id}: {from} -> {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub id: String,
    pub from: String,
    pub to: String,
}

/// A status enum with a fixed adjacency table
pub trait Lifecycle: Copy + Eq + Display + Sized + 'static {
    /// Entity name used in errors and logs
    const ENTITY: &'static str;

    /// States reachable in one step from `self`
    fn allowed_transitions(&self) -> &'static [Self];

    fn can_transition_to(&self, target: Self) -> bool {
        self.allowed_transitions().contains(&target)
    }

    fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Validate a transition, producing a typed error on rejection
    fn check_transition(&self, id: &str, target: Self) -> Result<(), TransitionError> {
        if self.can_transition_to(target) {
            Ok(())
        } else {
            Err(TransitionError {
                entity: Self::ENTITY,
                id: id.to_string(),
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}
