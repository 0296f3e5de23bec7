//! Remote document store seam.
//!
//! The cloud store is a generic document database exposing
//! create/update/get/query over a sessions collection. The engine only
//! needs this narrow surface, so it is a trait: production code plugs in
//! the HTTP client from [`crate::http`], tests use the in-memory
//! implementation below with fault injection.

use std::collections::{BTreeMap, HashSet};

use crate::error::RemoteError;
use crate::types::{SessionDoc, SessionPatch};

/// Collection-scoped operations on the remote sessions store.
pub trait SessionStore {
    /// Create a session document; returns the server-issued id.
    fn create_session(&mut self, doc: &SessionDoc) -> Result<String, RemoteError>;

    /// Partial field merge onto an existing document.
    fn update_session(&mut self, id: &str, patch: &SessionPatch) -> Result<(), RemoteError>;

    /// Existence-checked get-by-id.
    fn get_session(&self, id: &str) -> Result<Option<SessionDoc>, RemoteError>;

    /// Equality-filtered query: the user's sessions with no end time set.
    fn unfinished_sessions(&self, uid: &str) -> Result<Vec<(String, SessionDoc)>, RemoteError>;

    /// Suspend or resume network use. While suspended every call must
    /// fail fast with [`RemoteError::Unavailable`] instead of retrying.
    fn set_network_enabled(&mut self, enabled: bool);
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-memory `SessionStore` with fault injection, for tests and
/// embedders that do not need a real backend.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    docs: BTreeMap<String, SessionDoc>,
    next_id: u64,
    network_suspended: bool,
    /// When true every call fails as unavailable (simulated outage)
    pub fail_all: bool,
    /// Session titles whose create/update/finish calls fail (simulated
    /// per-document rejection, for group-isolation tests)
    pub fail_titles: HashSet<String>,
    /// Call counters for idempotency assertions
    pub create_calls: u32,
    pub update_calls: u32,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        MemorySessionStore::default()
    }

    pub fn doc_count(&self) -> usize {
        self.docs.len()
    }

    pub fn doc(&self, id: &str) -> Option<&SessionDoc> {
        self.docs.get(id)
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.network_suspended {
            return Err(RemoteError::unavailable("network layer suspended"));
        }
        if self.fail_all {
            return Err(RemoteError::unavailable("simulated outage"));
        }
        Ok(())
    }

    fn check_title(&self, title: &str) -> Result<(), RemoteError> {
        if self.fail_titles.contains(title) {
            return Err(RemoteError::Http {
                status: 503,
                message: format!("simulated rejection for '{}'", title),
            });
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    fn create_session(&mut self, doc: &SessionDoc) -> Result<String, RemoteError> {
        self.check_reachable()?;
        self.check_title(&doc.session_title)?;
        self.create_calls += 1;
        self.next_id += 1;
        let id = format!("remote-{}", self.next_id);
        self.docs.insert(id.clone(), doc.clone());
        Ok(id)
    }

    fn update_session(&mut self, id: &str, patch: &SessionPatch) -> Result<(), RemoteError> {
        self.check_reachable()?;
        let title = self
            .docs
            .get(id)
            .map(|d| d.session_title.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        self.check_title(&title)?;
        self.update_calls += 1;
        let doc = self.docs.get_mut(id).expect("checked above");
        if let Some(timestamps) = &patch.timestamps {
            doc.timestamps = timestamps.clone();
        }
        if let Some(ended_at) = patch.ended_at {
            doc.ended_at = Some(ended_at);
        }
        if let Some(is_merged) = patch.is_merged {
            doc.is_merged = is_merged;
        }
        Ok(())
    }

    fn get_session(&self, id: &str) -> Result<Option<SessionDoc>, RemoteError> {
        self.check_reachable()?;
        Ok(self.docs.get(id).cloned())
    }

    fn unfinished_sessions(&self, uid: &str) -> Result<Vec<(String, SessionDoc)>, RemoteError> {
        self.check_reachable()?;
        Ok(self
            .docs
            .iter()
            .filter(|(_, d)| d.uid == uid && d.ended_at.is_none())
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect())
    }

    fn set_network_enabled(&mut self, enabled: bool) {
        self.network_suspended = !enabled;
    }
}
