//! Live session registry.
//!
//! Process-wide map from device id to the handle of its live session.
//! Sessions register once identified; a later connection from the same
//! device supersedes the earlier one.

use crate::session::SessionHandle;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identified session. Returns the superseded handle when
    /// the same device was already connected.
    pub fn insert(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().unwrap();
        let old = sessions.insert(handle.identifier().to_string(), handle);
        if old.is_some() {
            debug!("Superseding earlier session");
        }
        old
    }

    /// Remove a session on disconnect. The connection id guards against a
    /// stale session tearing down its successor's registration.
    pub fn remove(&self, identifier: &str, connection_id: uuid::Uuid) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(existing) = sessions.get(identifier) {
            if existing.connection_id() == connection_id {
                sessions.remove(identifier);
            }
        }
    }

    pub fn get(&self, identifier: &str) -> Option<SessionHandle> {
        self.sessions.read().unwrap().get(identifier).cloned()
    }

    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.read().unwrap().values().cloned().collect()
    }
}
