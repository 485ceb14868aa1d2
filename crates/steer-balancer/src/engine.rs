//! Engine — the periodic tick and the per-request selection path.
//!
//! One tick: poll telemetry, publish the new statuses, move sessions off
//! newly-down backends, rank, recompute cost, publish the final ranking,
//! save backends, record a perf snapshot, flush events, reap sessions.
//!
//! Requests read the last published ranking and never wait on a tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use steer_core::{SteerConfig, epoch_millis};
use steer_state::{
    Backend, BackendClass, BackendId, BackendPerf, Cutover, DownEvent, Millis, PerfSnapshot,
    SessionId, StateStore,
};

use crate::controls::{Controls, Settings};
use crate::cost::{self, CostController, CostSnapshot};
use crate::error::{BalancerError, BalancerResult};
use crate::events::EventLog;
use crate::poller::{TelemetrySource, poll_backends};
use crate::redistribute::{redistribute, select_targets};
use crate::registry::{BackendRegistry, Ranking, Scored};
use crate::scorer::rank_backends;
use crate::selector::select_backend;
use crate::tracker::{SessionPolicy, SessionTracker, is_delayed};

/// Selections redone when the session moves underneath a request.
const MAX_SELECT_ATTEMPTS: u32 = 3;

/// Write configured backends to the store with fresh status.
pub fn seed_backends(store: &StateStore, config: &SteerConfig) -> BalancerResult<Vec<Backend>> {
    for stale in store.list_all_backends()? {
        if !config.backends.iter().any(|b| b.id == stale.id) {
            store.delete_backend(&stale.id)?;
            info!(backend = %stale.id, "backend no longer configured; removed");
        }
    }

    let mut seeded = Vec::with_capacity(config.backends.len());
    for backend_config in &config.backends {
        let backend = Backend::from_config(backend_config);
        store.put_backend(&backend)?;
        seeded.push(backend);
    }
    info!(count = seeded.len(), "backends seeded from config");
    Ok(seeded)
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Another tick was still running; nothing was done.
    pub skipped: bool,
    pub newly_down: Vec<BackendId>,
    pub down_event: Option<DownEvent>,
    pub cost: CostSnapshot,
    pub reaped: u32,
}

/// Result of routing one playlist request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub session_id: SessionId,
    pub backend: Backend,
    /// The session was on a different backend (or none) before this request.
    pub changed: bool,
    pub delayed: bool,
    /// Where this stream was served from last, when that was elsewhere.
    pub previous_cutover: Option<Cutover>,
}

/// State only the tick touches. Holding its lock means a tick is running.
struct TickState {
    cost: CostController,
}

pub struct Engine {
    store: StateStore,
    registry: BackendRegistry,
    controls: Controls,
    tracker: SessionTracker,
    events: EventLog,
    source: TelemetrySource,
    tick_state: Mutex<TickState>,
}

impl Engine {
    /// Build an engine over the backends already in `store`.
    pub fn new(
        store: StateStore,
        source: TelemetrySource,
        settings: Settings,
        policy: SessionPolicy,
    ) -> BalancerResult<Self> {
        let initial = Ranking::initial(store.list_all_backends()?)?;
        info!(
            backends = initial.ranked.len(),
            last_resort = %initial.last_resort.id,
            criterion = %settings.criterion,
            "engine initialized"
        );
        Ok(Self {
            registry: BackendRegistry::new(initial),
            controls: Controls::new(settings),
            tracker: SessionTracker::new(store.clone(), policy),
            events: EventLog::new(store.clone()),
            store,
            source,
            tick_state: Mutex::new(TickState {
                cost: CostController::new(),
            }),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn controls(&self) -> &Controls {
        &self.controls
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    // ── Selection API ──────────────────────────────────────────────

    /// Start a new session and return its id.
    pub fn on_new_session(&self, now: Millis) -> BalancerResult<SessionId> {
        Ok(self.tracker.create(now)?.id)
    }

    /// Pick the backend for one playlist request and record the request.
    ///
    /// If the session is reassigned between the read and the write (by
    /// redistribution, say) the selection is redone from the stored state.
    /// If the session keeps losing write races the selection is still
    /// returned; the assignment is retried on the next request.
    pub fn on_request(&self, session_id: &str, stream_key: &str, now: Millis) -> BalancerResult<RequestOutcome> {
        let settings = self.controls.current();
        for attempt in 1..=MAX_SELECT_ATTEMPTS {
            let session = self.tracker.resolve(session_id, now)?;
            let delayed = is_delayed(&session, stream_key, now, settings.delay_threshold_ms);
            let ranking = self.registry.snapshot();

            let selection = select_backend(&session, &ranking, delayed, now);
            let changed = session.assigned_backend.as_deref() != Some(selection.backend.id.as_str());

            let previous_cutover = match self.tracker.commit(session, &selection.backend.id, stream_key, now) {
                Ok(committed) => committed.previous_cutover,
                Err(BalancerError::SessionContended(_)) => None,
                Err(BalancerError::SessionMoved(_)) => {
                    debug!(session = %session_id, attempt, "session moved during request, selecting again");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(event) = selection.delay {
                self.events.record_delay(event);
            }

            debug!(
                session = %session_id,
                stream = %stream_key,
                backend = %selection.backend.id,
                changed,
                delayed,
                "request routed"
            );
            return Ok(RequestOutcome {
                session_id: session_id.to_string(),
                backend: selection.backend,
                changed,
                delayed,
                previous_cutover,
            });
        }
        warn!(session = %session_id, attempts = MAX_SELECT_ATTEMPTS, "session kept moving, request abandoned");
        Err(BalancerError::SessionContended(session_id.to_string()))
    }

    /// Remember the last segment served for a stream after rewriting.
    pub fn record_last_segment(
        &self,
        session_id: &str,
        stream_key: &str,
        backend_id: &BackendId,
        segment: &str,
        now: Millis,
    ) -> BalancerResult<()> {
        self.tracker
            .record_last_segment(session_id, stream_key, backend_id, segment, now)?;
        Ok(())
    }

    // ── Tick ───────────────────────────────────────────────────────

    /// Run one tick at time `now`. Skipped if another tick is running.
    pub async fn tick(&self, now: Millis) -> TickReport {
        let Ok(mut state) = self.tick_state.try_lock() else {
            debug!("tick skipped, previous tick still running");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };
        let settings = self.controls.current();
        let previous = self.registry.snapshot();

        // Poll and publish statuses before anything else reads them.
        let polled = poll_backends(&self.source, previous.all_backends().cloned().collect()).await;
        let (mut edges, mut origins): (Vec<Backend>, Vec<Backend>) = polled
            .backends
            .into_iter()
            .partition(|b| b.class == BackendClass::EdgeCache);
        let last_resort = origins.pop().unwrap_or_else(|| previous.last_resort.clone());
        self.publish_statuses(&previous, &edges, &last_resort);

        let newly_down: Vec<BackendId> = polled.newly_down.iter().map(|b| b.id.clone()).collect();
        let down_event = if newly_down.is_empty() {
            None
        } else {
            self.redistribute_from(&polled.newly_down, &edges, &last_resort, &settings, now)
        };

        let live = self.tracker.live_counts(now).unwrap_or_else(|e| {
            warn!(error = %e, "live session counts unavailable");
            HashMap::new()
        });
        let ranked = rank_backends(std::mem::take(&mut edges), &live, &settings.criterion);
        let ranked_backends: Vec<Backend> = ranked.iter().map(|s| s.backend.clone()).collect();
        let cost = state
            .cost
            .update(&ranked_backends, &last_resort, &live, &settings);

        self.save_backends(ranked_backends.iter().chain(std::iter::once(&last_resort)));
        self.record_perf(&ranked_backends, &last_resort, &live, &cost, &settings, now);
        self.registry.publish(Ranking {
            ranked,
            last_resort,
            current_cost: cost.current_cost,
            cost_ceiling: cost.cost_ceiling,
            minimum_cost: cost.minimum_cost,
            updated_at: now,
        });

        // Failures stay buffered and are retried next tick.
        let _ = self.events.flush();

        let reaped = self.tracker.reap(now).unwrap_or_else(|e| {
            warn!(error = %e, "session reap failed");
            0
        });

        TickReport {
            skipped: false,
            newly_down,
            down_event,
            cost,
            reaped,
        }
    }

    /// Tick every `interval` until `shutdown` flips, then flush events.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "engine started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while in_flight.try_join_next().is_some() {}
                    let engine = Arc::clone(&self);
                    in_flight.spawn(async move {
                        engine.tick(epoch_millis()).await;
                    });
                }
                _ = shutdown.changed() => {
                    info!("engine shutting down");
                    break;
                }
            }
        }

        // Let in-flight ticks finish before the final flush.
        while in_flight.join_next().await.is_some() {}
        self.shutdown();
    }

    /// Write whatever is still buffered.
    pub fn shutdown(&self) {
        match self.events.flush() {
            Ok(n) => info!(flushed = n, "engine stopped"),
            Err(e) => error!(error = %e, "final event flush failed"),
        }
    }

    fn publish_statuses(&self, previous: &Ranking, edges: &[Backend], last_resort: &Backend) {
        let by_id: HashMap<&str, &Backend> = edges.iter().map(|b| (b.id.as_str(), b)).collect();
        let ranked = previous
            .ranked
            .iter()
            .map(|s| {
                let backend = by_id
                    .get(s.backend.id.as_str())
                    .map(|b| (*b).clone())
                    .unwrap_or_else(|| s.backend.clone());
                let score = if backend.is_down() { f64::NEG_INFINITY } else { s.score };
                Scored { backend, score }
            })
            .collect();
        self.registry.publish(Ranking {
            ranked,
            last_resort: last_resort.clone(),
            ..previous.clone()
        });
    }

    fn redistribute_from(
        &self,
        newly_down: &[Backend],
        edges: &[Backend],
        last_resort: &Backend,
        settings: &Settings,
        now: Millis,
    ) -> Option<DownEvent> {
        let ids: Vec<BackendId> = newly_down.iter().map(|b| b.id.clone()).collect();
        let affected = match self.tracker.live_sessions_on(&ids, now) {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, down = ?ids, "cannot load sessions to redistribute");
                return None;
            }
        };

        let budget = cost::minimum_cost(edges, last_resort).map(|min| {
            cost::redistribution_budget(min, settings.maximum_cost, settings.trigger_ratio)
        });
        let targets = select_targets(edges, last_resort, budget);
        let event = redistribute(&self.tracker, newly_down, affected, &targets, now)?;
        self.events.record_down(event.clone());
        Some(event)
    }

    fn save_backends<'a>(&self, backends: impl Iterator<Item = &'a Backend>) {
        for backend in backends {
            if let Err(e) = self.store.put_backend(backend) {
                warn!(backend = %backend.id, error = %e, "backend status not saved");
            }
        }
    }

    fn record_perf(
        &self,
        ranked: &[Backend],
        last_resort: &Backend,
        live: &HashMap<BackendId, u64>,
        cost: &CostSnapshot,
        settings: &Settings,
        now: Millis,
    ) {
        let delays = self.events.take_delay_counts();
        let backends: BTreeMap<String, BackendPerf> = ranked
            .iter()
            .chain(std::iter::once(last_resort))
            .map(|b| {
                let perf = BackendPerf {
                    is_down: b.is_down(),
                    client_count: live.get(&b.id).copied().unwrap_or(0),
                    delay_count: delays.get(&b.name).copied().unwrap_or(0),
                };
                (b.name.clone(), perf)
            })
            .collect();

        self.events.record_perf(PerfSnapshot {
            current_cost: cost.current_cost,
            cost_ceiling: cost.cost_ceiling,
            maximum_cost: settings.maximum_cost,
            backends,
            time: now,
        });
    }
}
