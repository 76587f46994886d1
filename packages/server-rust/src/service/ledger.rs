//! Append-only, per-session record of executed operations.
//!
//! Each session has its own lock, so appends from unrelated sessions never
//! contend. Ordering within a session is by timestamp only; there is no
//! global sequence. Retention is the caller's business: the engine never
//! drops an entry unless [`Ledger::evict_session`] or
//! [`Ledger::prune_before`] is called.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use portalfed_core::{Operation, StepResult};
use serde::Serialize;

/// One terminal step outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub session_id: String,
    pub workflow_id: String,
    pub operation: Operation,
    pub result: StepResult,
    pub recorded_at_ms: u64,
}

/// A session's entries at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: String,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Default)]
pub struct Ledger {
    sessions: DashMap<String, Arc<Mutex<Vec<LedgerEntry>>>>,
}

impl Ledger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry`, creating its session on first use. The push happens
    /// under the map guard so a concurrent eviction cannot orphan it.
    pub fn append(&self, entry: LedgerEntry) {
        let slot = self.sessions.entry(entry.session_id.clone()).or_default();
        slot.value().lock().push(entry);
    }

    /// Entries of `session_id` sorted by timestamp. `None` for a session that
    /// never recorded anything.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Session> {
        let slot = self.sessions.get(session_id)?.value().clone();
        let mut entries = slot.lock().clone();
        entries.sort_by_key(|e| e.recorded_at_ms);
        Some(Session {
            session_id: session_id.to_string(),
            entries,
        })
    }

    /// Entries of one workflow within a session.
    #[must_use]
    pub fn workflow_entries(&self, session_id: &str, workflow_id: &str) -> Vec<LedgerEntry> {
        self.session(session_id)
            .map(|s| {
                s.entries
                    .into_iter()
                    .filter(|e| e.workflow_id == workflow_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Total number of entries across sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.iter().map(|e| e.value().lock().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops a whole session. Returns how many entries it held.
    pub fn evict_session(&self, session_id: &str) -> usize {
        self.sessions
            .remove(session_id)
            .map_or(0, |(_, slot)| slot.lock().len())
    }

    /// Drops entries recorded before `cutoff_ms`, and sessions left empty.
    /// Returns how many entries were removed.
    pub fn prune_before(&self, cutoff_ms: u64) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, slot| {
            let mut entries = slot.lock();
            let before = entries.len();
            entries.retain(|e| e.recorded_at_ms >= cutoff_ms);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
