//! SessionManager - typed session lifecycle over the store

use tracing::debug;

use crate::domain::{Session, SessionState, TransitionError};
use crate::state::{StateError, StateManager, StateResponse};

#[derive(Clone)]
pub struct SessionManager {
    state: StateManager,
}

impl SessionManager {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    /// Persist a new session in `created`
    pub async fn create(&self, project_id: &str, agent_type: &str) -> StateResponse<Session> {
        debug!(%project_id, %agent_type, "SessionManager::create: called");
        let session = Session::new(project_id, agent_type);
        self.state.create_session(session.clone()).await?;
        Ok(session)
    }

    /// Validated transition; a rejected one leaves the stored session as it was
    pub async fn transition(&self, session_id: &str, target: SessionState) -> StateResponse<Session> {
        self.state.transition_session(session_id, target).await
    }

    pub async fn get(&self, session_id: &str) -> StateResponse<Option<Session>> {
        self.state.get_session(session_id).await
    }

    pub async fn list(&self, project_id: Option<&str>) -> StateResponse<Vec<Session>> {
        self.state.list_sessions(project_id.map(str::to_string)).await
    }
}

/// Pull the typed transition error out of a state error, if that is what it was
pub fn as_transition_error(err: &StateError) -> Option<&TransitionError> {
    match err {
        StateError::InvalidTransition(e) => Some(e),
        _ => None,
    }
}
