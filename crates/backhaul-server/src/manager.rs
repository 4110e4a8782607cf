//! Session manager for connected agents
//!
//! Maps an agent key to its live peer-role [`Session`]. At most one session
//! exists per key; the first registration wins until it is removed.

use backhaul_mux::{ControlSocket, Dialer, Session, SessionConfig};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Agent {0} is already connected")]
    DuplicateAgent(String),

    #[error("No such agent: {0}")]
    NoSuchAgent(String),
}

/// Registry of connected agents
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly upgraded control socket under `key`.
    ///
    /// The returned session is not served yet; the caller drives `serve()`.
    pub fn add_agent(
        &self,
        key: &str,
        socket: ControlSocket,
        config: SessionConfig,
    ) -> Result<Session, ManagerError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.contains_key(key) {
            tracing::warn!(agent_id = %key, "Rejected duplicate agent registration");
            return Err(ManagerError::DuplicateAgent(key.to_string()));
        }

        let session = Session::peer(socket, config);
        sessions.insert(key.to_string(), session.clone());

        tracing::info!(agent_id = %key, agents = sessions.len(), "Registered agent");
        Ok(session)
    }

    /// A dialer reaching through the agent's session.
    ///
    /// `NoSuchAgent` means the agent is not connected right now; ask again
    /// once it has reconnected.
    pub fn get_agent_dialer(&self, key: &str, deadline: Duration) -> Result<Dialer, ManagerError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(key)
            .map(|session| session.dialer(deadline))
            .ok_or_else(|| ManagerError::NoSuchAgent(key.to_string()))
    }

    /// Remove the agent and close its session, tearing down every open connection
    pub async fn remove_agent(&self, key: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);

        match removed {
            Some(session) => {
                tracing::info!(agent_id = %key, "Removing agent");
                session.close().await;
                true
            }
            None => {
                tracing::debug!(agent_id = %key, "Attempted to remove unknown agent");
                false
            }
        }
    }

    /// Remove `key` only while it still maps to `session`.
    ///
    /// A session that exits late must not evict a successor registered under
    /// the same key.
    pub fn remove_session(&self, key: &str, session: &Session) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let is_current = sessions
            .get(key)
            .is_some_and(|current| current.ptr_eq(session));
        if is_current {
            sessions.remove(key);
            tracing::info!(agent_id = %key, agents = sessions.len(), "Unregistered agent");
        }
        is_current
    }

    pub fn has_agent(&self, key: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn agent_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
