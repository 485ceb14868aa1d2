//! Domain types for the Steer state store.
//!
//! These types represent the persisted state of backends, sessions, and the
//! append-only event log. All types are serializable to/from JSON for
//! storage in redb tables.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use steer_core::config::BackendConfig;
pub use steer_core::types::{BackendClass, BackendId, Metric, Millis, SessionId};

// ── Backend ───────────────────────────────────────────────────────

/// Most recent telemetry observation for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BackendStatus {
    pub is_down: bool,
    /// Bits per second served.
    pub bps: f64,
    /// Transactions per second served.
    pub tps: f64,
    /// Open client connections, tracked or not.
    pub connection_count: u64,
}

impl BackendStatus {
    /// Status reported for a backend that could not be polled.
    pub fn down() -> Self {
        Self {
            is_down: true,
            ..Self::default()
        }
    }

    pub fn up(connection_count: u64, tps: f64, bps: f64) -> Self {
        Self {
            is_down: false,
            bps,
            tps,
            connection_count,
        }
    }

    /// Read the raw value of a ranking metric.
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Bps => self.bps,
            Metric::Tps => self.tps,
            Metric::ConnectionCount => self.connection_count as f64,
        }
    }
}

/// Snapshot carried from one scoring tick to the next.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LastStatus {
    pub bps: f64,
    pub tps: f64,
    pub connection_count: u64,
    /// Live tracked sessions assigned to the backend at that tick.
    pub tracked_client_count: u64,
    /// Share of the ranked metric attributed to tracked sessions.
    pub isolated_metric: f64,
}

impl LastStatus {
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Bps => self.bps,
            Metric::Tps => self.tps,
            Metric::ConnectionCount => self.connection_count as f64,
        }
    }

    /// Connections not attributable to tracked sessions.
    pub fn background_load(&self) -> u64 {
        self.connection_count.saturating_sub(self.tracked_client_count)
    }
}

/// A CDN endpoint sessions can be routed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub id: BackendId,
    pub name: String,
    pub class: BackendClass,
    /// Per-session rate. Only the last resort may leave this unset.
    pub cost: Option<f64>,
    pub telemetry_url: Option<String>,
    /// Base URL segment URIs are resolved against.
    pub source_base_url: String,
    pub status: BackendStatus,
    pub last_status: LastStatus,
}

impl Backend {
    /// Build a fresh backend from static configuration. Status starts up.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            class: config.class,
            cost: config.cost,
            telemetry_url: config.telemetry_url.clone(),
            source_base_url: config.source_base_url.clone(),
            status: BackendStatus::default(),
            last_status: LastStatus::default(),
        }
    }

    pub fn is_down(&self) -> bool {
        self.status.is_down
    }
}

// ── Session ───────────────────────────────────────────────────────

/// Where a stream was last served from, for manifest cutover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cutover {
    pub backend: BackendId,
    /// URI of the last segment handed to the client, once known.
    pub last_segment: Option<String>,
    pub updated_at: Millis,
}

/// One client's ongoing viewing connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub assigned_backend: Option<BackendId>,
    /// Absolute expiry; the session is gone once this passes.
    pub expires_at: Millis,
    /// Stream key → recent request times, oldest first.
    #[serde(default)]
    pub request_history: BTreeMap<String, VecDeque<Millis>>,
    /// Stream key → last serving backend and segment.
    #[serde(default)]
    pub cutovers: BTreeMap<String, Cutover>,
    /// Optimistic-concurrency stamp, bumped by every successful write.
    #[serde(default)]
    pub version: u64,
    pub created_at: Millis,
}

impl Session {
    /// A new, unassigned session that has never been stored.
    pub fn new(id: impl Into<SessionId>, now: Millis, ttl_ms: u64) -> Self {
        Self {
            id: id.into(),
            assigned_backend: None,
            expires_at: now.saturating_add(ttl_ms),
            request_history: BTreeMap::new(),
            cutovers: BTreeMap::new(),
            version: 0,
            created_at: now,
        }
    }

    pub fn is_live(&self, now: Millis) -> bool {
        self.expires_at > now
    }

    /// Push expiry out to `ttl_ms` from now.
    pub fn refresh(&mut self, now: Millis, ttl_ms: u64) {
        self.expires_at = now.saturating_add(ttl_ms);
    }

    /// Most recent request time for a stream, if any.
    pub fn last_request(&self, stream_key: &str) -> Option<Millis> {
        self.request_history
            .get(stream_key)
            .and_then(|times| times.back().copied())
    }

    /// Append a request time, dropping the oldest entries beyond `bound`.
    pub fn record_request(&mut self, stream_key: &str, now: Millis, bound: usize) {
        let times = self
            .request_history
            .entry(stream_key.to_string())
            .or_default();
        times.push_back(now);
        while times.len() > bound {
            times.pop_front();
        }
    }
}

// ── Events ────────────────────────────────────────────────────────

/// A session's stream stalled and its backend was blacklisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayEvent {
    pub prev_backend: String,
    pub new_backend: String,
    pub session_id: SessionId,
    pub time: Millis,
}

/// Backends went down and their sessions were moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownEvent {
    pub down_backend_names: Vec<String>,
    /// Target backend name → sessions moved there.
    pub distribution_counts: BTreeMap<String, u64>,
    pub prev_session_count: u64,
    pub time: Millis,
}

/// Per-backend counters inside a `PerfSnapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendPerf {
    pub is_down: bool,
    pub client_count: u64,
    /// Delay events blacklisting this backend since the previous snapshot.
    pub delay_count: u64,
}

/// Periodic cost and load snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfSnapshot {
    pub current_cost: f64,
    pub cost_ceiling: Option<f64>,
    pub maximum_cost: f64,
    /// Backend name → counters.
    pub backends: BTreeMap<String, BackendPerf>,
    pub time: Millis,
}

/// Any record in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventRecord {
    Delay(DelayEvent),
    Down(DownEvent),
    Perf(PerfSnapshot),
}

impl EventRecord {
    pub fn time(&self) -> Millis {
        match self {
            EventRecord::Delay(e) => e.time,
            EventRecord::Down(e) => e.time,
            EventRecord::Perf(e) => e.time,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventRecord::Delay(_) => "delay",
            EventRecord::Down(_) => "down",
            EventRecord::Perf(_) => "perf",
        }
    }
}
