//! StateStore — redb-backed state persistence for Steer.
//!
//! Provides typed operations over backends, sessions, and events. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Tie-breaker for events appended within the same millisecond.
    event_seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            event_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(BACKENDS).map_err(map_err!(Table))?;
        txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Backends ───────────────────────────────────────────────────

    /// Insert or update a backend.
    pub fn put_backend(&self, backend: &Backend) -> StateResult<()> {
        let value = serde_json::to_vec(backend).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BACKENDS).map_err(map_err!(Table))?;
            table
                .insert(backend.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a backend by ID.
    pub fn get_backend(&self, id: &str) -> StateResult<Option<Backend>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKENDS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let backend: Backend =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(backend))
            }
            None => Ok(None),
        }
    }

    /// Delete a backend. Returns true if it existed.
    pub fn delete_backend(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(BACKENDS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// List all backends of one class.
    pub fn list_backends(&self, class: BackendClass) -> StateResult<Vec<Backend>> {
        Ok(self
            .list_all_backends()?
            .into_iter()
            .filter(|b| b.class == class)
            .collect())
    }

    /// List every backend, ordered by ID.
    pub fn list_all_backends(&self) -> StateResult<Vec<Backend>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BACKENDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let backend: Backend =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(backend);
        }
        Ok(results)
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Get a session by ID, live or expired.
    pub fn get_session(&self, id: &str) -> StateResult<Option<Session>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let session: Session =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Write a session if nobody else wrote it since it was read.
    ///
    /// `session.version` must equal the stored version (0 for a session that
    /// was never stored). On success the stored copy, with its version
    /// bumped, is returned. On mismatch nothing is written and
    /// `StateError::Conflict` is returned; a missing record counts as
    /// version 0.
    pub fn upsert_session(&self, session: &Session) -> StateResult<Session> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut stored = session.clone();
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let found = match table.get(session.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: Session =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.version
                }
                None => 0,
            };
            if found != session.version {
                return Err(StateError::Conflict {
                    id: session.id.clone(),
                    expected: session.version,
                    found,
                });
            }
            stored.version = found + 1;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(session.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// All stored sessions currently assigned to any of `backend_ids`.
    pub fn list_sessions_assigned_to(&self, backend_ids: &[BackendId]) -> StateResult<Vec<Session>> {
        self.scan_sessions(|s| {
            s.assigned_backend
                .as_ref()
                .is_some_and(|b| backend_ids.contains(b))
        })
    }

    /// Number of live sessions assigned to one backend.
    pub fn count_live_sessions_assigned_to(&self, backend_id: &str, now: Millis) -> StateResult<u64> {
        Ok(self
            .count_live_sessions_by_backend(now)?
            .get(backend_id)
            .copied()
            .unwrap_or(0))
    }

    /// Live session counts for every backend that has any, in one scan.
    pub fn count_live_sessions_by_backend(&self, now: Millis) -> StateResult<HashMap<BackendId, u64>> {
        let mut counts = HashMap::new();
        for session in self.scan_sessions(|s| s.is_live(now))? {
            if let Some(backend) = session.assigned_backend {
                *counts.entry(backend).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Delete sessions whose expiry is at or before `cutoff`. Returns the count removed.
    pub fn reap_expired_sessions(&self, cutoff: Millis) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let session: Session =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if session.expires_at <= cutoff {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = expired.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(removed, cutoff, "expired sessions reaped");
        }
        Ok(removed)
    }

    fn scan_sessions(&self, keep: impl Fn(&Session) -> bool) -> StateResult<Vec<Session>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SESSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let session: Session =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&session) {
                results.push(session);
            }
        }
        Ok(results)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append a batch of events in a single transaction.
    pub fn append_events(&self, events: &[EventRecord]) -> StateResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            for event in events {
                let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
                let key = format!("{:020}:{:012}", event.time(), seq);
                let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = events.len(), "events appended");
        Ok(events.len())
    }

    /// The most recent events, newest first.
    pub fn list_recent_events(&self, limit: usize) -> StateResult<Vec<EventRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: EventRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }
}
