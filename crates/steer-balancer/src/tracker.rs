//! Session tracker: creation, lazy expiry, request history, and cutovers.
//!
//! Every session write is a version-checked upsert. A writer that loses a
//! race reloads the session, re-applies its change, and tries again a
//! bounded number of times.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use steer_core::SteerConfig;
use steer_state::{BackendId, Cutover, Millis, Session, StateStore};

use crate::error::{BalancerError, BalancerResult};

/// Attempts a request-path write gets before giving up until the next request.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Session lifetime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Expiry distance from the last request.
    pub ttl: Duration,
    /// Timestamps kept per stream.
    pub history_len: usize,
    /// How long an expired session stays in storage.
    pub reap_grace: Duration,
}

impl SessionPolicy {
    pub fn from_config(config: &SteerConfig) -> Result<Self, steer_core::ConfigError> {
        Ok(Self {
            ttl: config.sessions.ttl()?,
            history_len: config.sessions.history_len,
            reap_grace: config.sessions.reap_grace()?,
        })
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            history_len: 10,
            reap_grace: Duration::from_secs(60),
        }
    }
}

/// Whether a stream stalled: the gap since its last request exceeds the threshold.
///
/// A stream with no prior request is never delayed.
pub fn is_delayed(session: &Session, stream_key: &str, now: Millis, threshold_ms: u64) -> bool {
    session
        .last_request(stream_key)
        .is_some_and(|last| now.saturating_sub(last) > threshold_ms)
}

/// Result of committing a served request.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub session: Session,
    /// Cutover for the stream before this request, if it pointed elsewhere.
    pub previous_cutover: Option<Cutover>,
}

pub struct SessionTracker {
    store: StateStore,
    policy: SessionPolicy,
}

impl SessionTracker {
    pub fn new(store: StateStore, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    /// Create and store a brand-new session with a fresh id.
    pub fn create(&self, now: Millis) -> BalancerResult<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id, now, self.policy.ttl_ms());
        let stored = self.store.upsert_session(&session)?;
        debug!(session = %stored.id, "session created");
        Ok(stored)
    }

    /// Load a session for a request, refreshing its expiry in memory.
    ///
    /// Unknown and expired ids yield a fresh, unassigned session under the
    /// same id. The stored version is kept so the next write still checks it.
    pub fn resolve(&self, id: &str, now: Millis) -> BalancerResult<Session> {
        let ttl = self.policy.ttl_ms();
        let session = match self.store.get_session(id)? {
            Some(mut session) if session.is_live(now) => {
                session.refresh(now, ttl);
                session
            }
            Some(expired) => {
                debug!(session = %id, "expired session restarted");
                let mut fresh = Session::new(id, now, ttl);
                fresh.version = expired.version;
                fresh
            }
            None => {
                debug!(session = %id, "unknown session adopted");
                Session::new(id, now, ttl)
            }
        };
        Ok(session)
    }

    /// Persist a served request: assignment, history, expiry, and cutover.
    pub fn commit(
        &self,
        session: Session,
        backend_id: &BackendId,
        stream_key: &str,
        now: Millis,
    ) -> BalancerResult<Committed> {
        let ttl = self.policy.ttl_ms();
        let history_len = self.policy.history_len;
        let based_on = session.assigned_backend.clone();
        let mut previous_cutover = None;

        let still_valid = |s: &Session| s.assigned_backend == based_on;
        let stored = self.write_with_retry(session, now, still_valid, |s| {
            s.assigned_backend = Some(backend_id.clone());
            s.record_request(stream_key, now, history_len);
            s.refresh(now, ttl);

            previous_cutover = None;
            let unchanged = s
                .cutovers
                .get(stream_key)
                .is_some_and(|c| &c.backend == backend_id);
            if !unchanged {
                previous_cutover = s.cutovers.insert(
                    stream_key.to_string(),
                    Cutover {
                        backend: backend_id.clone(),
                        last_segment: None,
                        updated_at: now,
                    },
                );
            }
        })?;

        Ok(Committed {
            session: stored,
            previous_cutover,
        })
    }

    /// Record the last segment handed out for a stream by `backend_id`.
    pub fn record_last_segment(
        &self,
        id: &str,
        stream_key: &str,
        backend_id: &BackendId,
        segment: &str,
        now: Millis,
    ) -> BalancerResult<Session> {
        let session = self.resolve(id, now)?;
        self.write_with_retry(session, now, |_| true, |s| {
            s.cutovers.insert(
                stream_key.to_string(),
                Cutover {
                    backend: backend_id.clone(),
                    last_segment: Some(segment.to_string()),
                    updated_at: now,
                },
            );
        })
    }

    /// Move a session to another backend, for redistribution. Retries once.
    pub fn reassign(&self, mut session: Session, backend_id: &BackendId) -> BalancerResult<Session> {
        session.assigned_backend = Some(backend_id.clone());
        match self.store.upsert_session(&session) {
            Err(e) if e.is_conflict() => {
                let Some(mut current) = self.store.get_session(&session.id)? else {
                    return Err(e.into());
                };
                current.assigned_backend = Some(backend_id.clone());
                Ok(self.store.upsert_session(&current)?)
            }
            other => Ok(other?),
        }
    }

    /// Live sessions per backend.
    pub fn live_counts(&self, now: Millis) -> BalancerResult<HashMap<BackendId, u64>> {
        Ok(self.store.count_live_sessions_by_backend(now)?)
    }

    /// Live sessions assigned to any of `backend_ids`.
    pub fn live_sessions_on(&self, backend_ids: &[BackendId], now: Millis) -> BalancerResult<Vec<Session>> {
        Ok(self
            .store
            .list_sessions_assigned_to(backend_ids)?
            .into_iter()
            .filter(|s| s.is_live(now))
            .collect())
    }

    /// Drop sessions that expired longer than the grace period ago.
    pub fn reap(&self, now: Millis) -> BalancerResult<u32> {
        let cutoff = now.saturating_sub(self.policy.reap_grace.as_millis() as u64);
        Ok(self.store.reap_expired_sessions(cutoff)?)
    }

    /// Apply `apply` and write, reloading on conflict.
    ///
    /// A reloaded session that fails `still_valid` is not written; the
    /// caller gets `SessionMoved` and decides again from the new state.
    fn write_with_retry(
        &self,
        mut session: Session,
        now: Millis,
        still_valid: impl Fn(&Session) -> bool,
        mut apply: impl FnMut(&mut Session),
    ) -> BalancerResult<Session> {
        let id = session.id.clone();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            apply(&mut session);
            match self.store.upsert_session(&session) {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_conflict() => {
                    debug!(session = %id, attempt, "session write conflict");
                    session = self.resolve(&id, now)?;
                    if !still_valid(&session) {
                        debug!(
                            session = %id,
                            assigned = ?session.assigned_backend,
                            "session reassigned underneath the write"
                        );
                        return Err(BalancerError::SessionMoved(id));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        warn!(session = %id, attempts = MAX_WRITE_ATTEMPTS, "session write abandoned");
        Err(BalancerError::SessionContended(id))
    }
}
