//! End-to-end engine scenarios with scripted telemetry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use steer_balancer::{Engine, SessionPolicy, Settings, TelemetrySource, seed_backends, telemetry_source};
use steer_core::SteerConfig;
use steer_state::{Backend, BackendStatus, EventRecord, StateStore};

const POOL: &str = r#"
[cost]
maximum_cost = 2.0
trigger_ratio = 0.9
set_ratio = 0.5

[ranking]
criterion = "bps"

[[backends]]
id = "a"
name = "A"
class = "edge-cache"
cost = 1.0
telemetry_url = "http://a.test/status"
source_base_url = "http://a.test/live/"

[[backends]]
id = "b"
name = "B"
class = "edge-cache"
cost = 1.0
telemetry_url = "http://b.test/status"
source_base_url = "http://b.test/live/"

[[backends]]
id = "c"
name = "C"
class = "edge-cache"
cost = 3.0
telemetry_url = "http://c.test/status"
source_base_url = "http://c.test/live/"

[[backends]]
id = "origin"
name = "Origin"
class = "fallback-origin"
source_base_url = "http://origin.test/live/"
"#;

/// Telemetry where each backend reports a fixed load unless switched off.
#[derive(Clone, Default)]
struct Scripted {
    down: Arc<Mutex<HashSet<String>>>,
}

impl Scripted {
    fn set_down(&self, id: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    fn source(&self, loads: &'static [(&'static str, f64)]) -> TelemetrySource {
        let down = Arc::clone(&self.down);
        telemetry_source(move |backend: Backend| {
            let is_down = down.lock().unwrap().contains(&backend.id);
            async move {
                if is_down {
                    return BackendStatus::down();
                }
                let bps = loads
                    .iter()
                    .find(|(id, _)| *id == backend.id)
                    .map(|(_, bps)| *bps)
                    .unwrap_or(0.0);
                BackendStatus::up(1, 1.0, bps)
            }
        })
    }
}

/// Two edges and a costed origin as the only other place to go.
const PAIR: &str = r#"
[cost]
maximum_cost = 2.0
trigger_ratio = 0.9
set_ratio = 0.5

[ranking]
criterion = "bps"

[[backends]]
id = "a"
name = "A"
class = "edge-cache"
cost = 1.0
telemetry_url = "http://a.test/status"
source_base_url = "http://a.test/live/"

[[backends]]
id = "b"
name = "B"
class = "edge-cache"
cost = 1.5
telemetry_url = "http://b.test/status"
source_base_url = "http://b.test/live/"

[[backends]]
id = "c"
name = "C"
class = "fallback-origin"
cost = 3.0
source_base_url = "http://c.test/live/"
"#;

fn engine(source: TelemetrySource) -> Engine {
    engine_with(POOL, source)
}

fn engine_with(pool: &str, source: TelemetrySource) -> Engine {
    let config = SteerConfig::from_toml_str(pool).unwrap();
    let store = StateStore::open_in_memory().unwrap();
    seed_backends(&store, &config).unwrap();
    Engine::new(
        store,
        source,
        Settings::from_config(&config).unwrap(),
        SessionPolicy::from_config(&config).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn down_backend_sessions_move_to_affordable_peer() {
    let script = Scripted::default();
    let engine = engine(script.source(&[("a", 10.0), ("b", 50.0), ("c", 100.0)]));
    engine.tick(0).await;

    let s = engine.on_new_session(0).unwrap();
    let first = engine.on_request(&s, "low.m3u8", 100).unwrap();
    assert_eq!(first.backend.id, "a");

    script.set_down("a", true);
    let report = engine.tick(1_000).await;
    assert_eq!(report.newly_down, vec!["a".to_string()]);

    let down = report.down_event.expect("sessions were moved");
    assert_eq!(down.down_backend_names, vec!["A".to_string()]);
    assert_eq!(down.prev_session_count, 1);
    assert_eq!(down.distribution_counts.len(), 1);
    assert_eq!(down.distribution_counts["B"], 1);

    let stored = engine.store().get_session(&s).unwrap().unwrap();
    assert_eq!(stored.assigned_backend.as_deref(), Some("b"));

    // The next request sticks to where redistribution put it.
    let next = engine.on_request(&s, "low.m3u8", 1_500).unwrap();
    assert_eq!(next.backend.id, "b");
    assert!(!next.changed);
    assert_eq!(next.previous_cutover.map(|c| c.backend), Some("a".to_string()));

    // The down event reached storage with the tick's batch.
    let events = engine.store().list_recent_events(20).unwrap();
    assert!(events.iter().any(|e| matches!(e, EventRecord::Down(d) if d.prev_session_count == 1)));
}

#[tokio::test]
async fn recovery_does_not_pull_sessions_back() {
    let script = Scripted::default();
    let engine = engine(script.source(&[("a", 10.0), ("b", 50.0), ("c", 100.0)]));
    engine.tick(0).await;

    let s = engine.on_new_session(0).unwrap();
    engine.on_request(&s, "low.m3u8", 100).unwrap();

    script.set_down("a", true);
    engine.tick(1_000).await;
    script.set_down("a", false);
    let report = engine.tick(2_000).await;
    assert!(report.newly_down.is_empty());
    assert_eq!(engine.registry().snapshot().ranked[0].backend.id, "a");

    assert_eq!(engine.on_request(&s, "low.m3u8", 2_500).unwrap().backend.id, "b");

    // A newcomer gets the recovered top backend.
    let fresh = engine.on_new_session(2_500).unwrap();
    assert_eq!(engine.on_request(&fresh, "low.m3u8", 2_600).unwrap().backend.id, "a");
}

#[tokio::test]
async fn everything_down_falls_back_to_origin() {
    let script = Scripted::default();
    let engine = engine(script.source(&[("a", 10.0), ("b", 50.0), ("c", 100.0)]));
    engine.tick(0).await;

    let s = engine.on_new_session(0).unwrap();
    engine.on_request(&s, "low.m3u8", 100).unwrap();

    for id in ["a", "b", "c"] {
        script.set_down(id, true);
    }
    let report = engine.tick(1_000).await;
    let down = report.down_event.unwrap();
    assert_eq!(down.down_backend_names.len(), 3);
    assert_eq!(down.distribution_counts["Origin"], 1);
    assert_eq!(engine.on_request(&s, "low.m3u8", 1_500).unwrap().backend.id, "origin");
}

#[tokio::test]
async fn cost_ceiling_steers_new_sessions_only() {
    let script = Scripted::default();
    // The expensive edge carries the least traffic and ranks first.
    let engine = engine(script.source(&[("c", 1.0), ("a", 50.0), ("b", 60.0)]));
    engine.tick(0).await;

    let mut early = Vec::new();
    for i in 0..4 {
        let s = engine.on_new_session(i).unwrap();
        assert_eq!(engine.on_request(&s, "low.m3u8", 10 + i).unwrap().backend.id, "c");
        early.push(s);
    }

    // Mean cost 3.0 beats the 1.9 trigger; the ceiling drops to 1.5.
    let report = engine.tick(1_000).await;
    assert_eq!(report.cost.current_cost, 3.0);
    assert_eq!(report.cost.cost_ceiling, Some(1.5));
    assert_eq!(engine.registry().snapshot().cost_ceiling, Some(1.5));

    let late = engine.on_new_session(1_100).unwrap();
    assert_eq!(engine.on_request(&late, "low.m3u8", 1_200).unwrap().backend.id, "a");

    // Existing sessions stay put.
    assert_eq!(engine.on_request(&early[0], "low.m3u8", 1_300).unwrap().backend.id, "c");
}

#[tokio::test]
async fn controls_apply_on_next_tick() {
    let script = Scripted::default();
    let engine = engine(script.source(&[("a", 10.0), ("b", 50.0), ("c", 100.0)]));
    engine.tick(0).await;
    assert_eq!(engine.registry().snapshot().ranked[0].backend.id, "a");

    // Per-connection bps: every backend reports one connection, so the busiest wins.
    engine
        .controls()
        .set_criterion("bps_per_connection".parse().unwrap())
        .unwrap();
    assert_eq!(engine.registry().snapshot().ranked[0].backend.id, "a");
    engine.tick(1_000).await;
    assert_eq!(engine.registry().snapshot().ranked[0].backend.id, "c");
}

#[tokio::test]
async fn budget_follows_the_surviving_minimum() {
    let script = Scripted::default();
    let engine = engine_with(PAIR, script.source(&[("a", 10.0), ("b", 50.0)]));
    engine.tick(0).await;

    let s = engine.on_new_session(0).unwrap();
    assert_eq!(engine.on_request(&s, "low.m3u8", 100).unwrap().backend.id, "a");

    // With A gone the minimum is B's 1.5, so the budget is 1.5 + 0.5 * 0.9.
    script.set_down("a", true);
    let report = engine.tick(1_000).await;
    let down = report.down_event.expect("sessions were moved");
    assert_eq!(down.down_backend_names, vec!["A".to_string()]);
    assert_eq!(down.prev_session_count, 1);
    assert_eq!(down.distribution_counts.len(), 1);
    assert_eq!(down.distribution_counts["B"], 1);

    let stored = engine.store().get_session(&s).unwrap().unwrap();
    assert_eq!(stored.assigned_backend.as_deref(), Some("b"));
    assert_eq!(engine.on_request(&s, "low.m3u8", 1_500).unwrap().backend.id, "b");
}
