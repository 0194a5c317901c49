//! Long-lived agent sessions

mod manager;

pub use manager::{SessionManager, as_transition_error};
