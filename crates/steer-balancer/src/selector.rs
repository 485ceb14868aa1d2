//! Per-request backend selection.

use steer_state::{Backend, DelayEvent, Millis, Session};

use crate::registry::Ranking;

/// Outcome of one selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub backend: Backend,
    /// Set when the request was delayed and the current backend was blacklisted.
    pub delay: Option<DelayEvent>,
}

/// Choose a backend for `session` from a published ranking.
///
/// In rank order, skipping down backends and the blacklisted one:
/// 1. the session's current backend is kept if it shows up (stickiness);
/// 2. otherwise the first backend within the cost ceiling is taken.
///
/// If nothing qualifies, the cheapest up backend seen wins, then the last
/// resort. A delayed request blacklists the session's current backend for
/// this one selection.
pub fn select_backend(session: &Session, ranking: &Ranking, is_delayed: bool, now: Millis) -> Selection {
    let blacklisted = if is_delayed {
        session.assigned_backend.as_deref()
    } else {
        None
    };
    let mut blacklisted_name = None;
    let mut cheapest: Option<&Backend> = None;
    let mut selected: Option<&Backend> = None;

    for backend in ranking.backends() {
        if blacklisted == Some(backend.id.as_str()) {
            blacklisted_name = Some(backend.name.clone());
            continue;
        }
        if backend.is_down() {
            continue;
        }
        if session.assigned_backend.as_deref() == Some(backend.id.as_str()) {
            selected = Some(backend);
            break;
        }
        if cheapest.is_none_or(|c| cost_of(backend) < cost_of(c)) {
            cheapest = Some(backend);
        }
        if let Some(ceiling) = ranking.cost_ceiling
            && cost_of(backend) > ceiling
        {
            continue;
        }
        if selected.is_none() {
            selected = Some(backend);
        }
    }

    let backend = selected
        .or(cheapest)
        .unwrap_or(&ranking.last_resort)
        .clone();

    let delay = is_delayed.then(|| DelayEvent {
        prev_backend: blacklisted_name.unwrap_or_else(|| ranking.last_resort.name.clone()),
        new_backend: backend.name.clone(),
        session_id: session.id.clone(),
        time: now,
    });

    Selection { backend, delay }
}

fn cost_of(backend: &Backend) -> f64 {
    backend.cost.unwrap_or(f64::INFINITY)
}
