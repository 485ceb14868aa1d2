//! Mass redistribution of sessions off backends that just went down.

use std::collections::BTreeMap;

use tracing::{info, warn};

use steer_state::{Backend, DownEvent, Millis, Session};

use crate::tracker::SessionTracker;

/// Backends eligible to receive moved sessions.
///
/// Up, costed backends within `budget` first; failing that any up backend;
/// failing that the last resort alone. `None` budget skips the cost filter.
pub fn select_targets(candidates: &[Backend], last_resort: &Backend, budget: Option<f64>) -> Vec<Backend> {
    let up = || candidates.iter().filter(|b| !b.is_down());

    let affordable: Vec<Backend> = up()
        .filter(|b| match (b.cost, budget) {
            (Some(cost), Some(budget)) => cost <= budget,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .cloned()
        .collect();
    if !affordable.is_empty() {
        return affordable;
    }

    let any_up: Vec<Backend> = up().cloned().collect();
    if !any_up.is_empty() {
        return any_up;
    }

    vec![last_resort.clone()]
}

/// Split `session_count` sessions into contiguous groups of `ceil(n / k)`, one per target.
///
/// Returns the target index for each session, in session order.
pub fn plan_groups(session_count: usize, target_count: usize) -> Vec<usize> {
    if target_count == 0 {
        return Vec::new();
    }
    let group = session_count.div_ceil(target_count);
    (0..session_count).map(|i| i / group).collect()
}

/// Move every session in `affected` onto `targets` and describe the move.
///
/// Each session is written on its own; a failed write is logged and skipped.
/// Returns `None` when there was nothing to move.
pub fn redistribute(
    tracker: &SessionTracker,
    newly_down: &[Backend],
    affected: Vec<Session>,
    targets: &[Backend],
    now: Millis,
) -> Option<DownEvent> {
    if affected.is_empty() || targets.is_empty() {
        return None;
    }
    let prev_session_count = affected.len() as u64;
    let plan = plan_groups(affected.len(), targets.len());

    let mut distribution_counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut failed = 0u64;
    for (session, idx) in affected.into_iter().zip(plan) {
        let target = &targets[idx];
        *distribution_counts.entry(target.name.clone()).or_insert(0) += 1;
        let session_id = session.id.clone();
        if let Err(e) = tracker.reassign(session, &target.id) {
            failed += 1;
            warn!(session = %session_id, target = %target.id, error = %e, "session not redistributed");
        }
    }

    let event = DownEvent {
        down_backend_names: newly_down.iter().map(|b| b.name.clone()).collect(),
        distribution_counts,
        prev_session_count,
        time: now,
    };
    info!(
        down = ?event.down_backend_names,
        sessions = prev_session_count,
        distribution = ?event.distribution_counts,
        failed,
        "sessions redistributed"
    );
    Some(event)
}
