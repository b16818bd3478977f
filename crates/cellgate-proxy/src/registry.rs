//! Session-to-notebook correlation state.
//!
//! Populated by observing the backend's kernel-creation control exchange
//! (custom request headers carry the notebook path and session id), read
//! on every rewrite attempt. Entries persist for process lifetime.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Maps a session identifier to the notebook path the session belongs to.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `session_id` executes against `notebook_path`.
    pub async fn record(&self, session_id: String, notebook_path: String) {
        info!(session_id = %session_id, notebook = %notebook_path, "session registered");
        self.sessions.write().await.insert(session_id, notebook_path);
    }

    /// Notebook path for a session, or `None` if never registered.
    pub async fn lookup(&self, session_id: &str) -> Option<String> {
        let found = self.sessions.read().await.get(session_id).cloned();
        if found.is_none() {
            debug!(session_id, "no notebook registered for session");
        }
        found
    }

    /// Number of registered sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
