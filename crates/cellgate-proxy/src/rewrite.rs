//! Execution-request rewriting.
//!
//! Replaces the numeric cell-index reference in an execute request's
//! `content.code` with the actual source text of that cell, so the
//! backend never sees raw indices and the client never ships source.
//! Pure transform over strings plus the notebook-lookup collaborator;
//! no socket I/O.

use crate::registry::SessionRegistry;
use cellgate_core::{parse_cell_index, KernelMessage, NotebookStore, EXECUTE_REQUEST};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a substitution attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Rewrite {
    /// Forward this payload (possibly rewritten, possibly untouched).
    Forward(String),
    /// Suppress the message; the stream stays alive.
    Discard,
}

/// Inspects decoded messages and substitutes cell source for cell indices.
pub struct MessageRewriter {
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn NotebookStore>,
}

impl MessageRewriter {
    pub fn new(sessions: Arc<SessionRegistry>, store: Arc<dyn NotebookStore>) -> Self {
        Self { sessions, store }
    }

    /// Rewrite an inbound payload. Never raises: every failure mode maps
    /// to [`Rewrite::Discard`] and the surrounding pipeline keeps going.
    pub async fn substitute(&self, raw: &str) -> Rewrite {
        // Fast path: skip parsing entirely when the marker is absent.
        if !raw.contains(EXECUTE_REQUEST) {
            return Rewrite::Forward(raw.to_string());
        }

        let mut msg: KernelMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "unparseable message matched the execute marker, discarding");
                return Rewrite::Discard;
            }
        };

        if !msg.is_execute_request() {
            return Rewrite::Forward(raw.to_string());
        }

        let session_id = msg.header.session.clone();
        let Some(notebook_path) = self.sessions.lookup(&session_id).await else {
            warn!(session_id = %session_id, "execute request from unregistered session, discarding");
            return Rewrite::Discard;
        };

        let notebook = match self.store.get(&notebook_path).await {
            Ok(nb) => nb,
            Err(e) => {
                warn!(notebook = %notebook_path, error = %e, "notebook lookup failed, discarding");
                return Rewrite::Discard;
            }
        };

        let Some(index) = msg.code().and_then(parse_cell_index) else {
            warn!(session_id = %session_id, "execute request code is not a cell index, discarding");
            return Rewrite::Discard;
        };

        let Some(source) = notebook.cell_source(index) else {
            warn!(notebook = %notebook_path, index, "cell index out of range, discarding");
            return Rewrite::Discard;
        };

        msg.set_code(source);
        match serde_json::to_string(&msg) {
            Ok(rewritten) => Rewrite::Forward(rewritten),
            Err(e) => {
                warn!(error = %e, "failed to re-serialize rewritten message, discarding");
                Rewrite::Discard
            }
        }
    }
}
