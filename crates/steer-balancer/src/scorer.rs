//! Backend scoring and ranking.
//!
//! Higher scores rank first. Under per-tracked-session normalization with
//! isolation, the scorer separates the metric attributable to tracked
//! sessions from untracked background load using the previous tick's
//! observation (`LastStatus`) as a second equation:
//!
//! ```text
//! metric      = tracked      · x + background      · y
//! last_metric = last_tracked · x + last_background · y
//! ```

use std::collections::HashMap;

use steer_state::{Backend, BackendId, LastStatus};
use steer_core::{Normalization, RankingCriterion};

use crate::registry::Scored;

/// Score of one backend plus the `LastStatus` to carry into the next tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendScore {
    pub score: f64,
    /// Replacement for the backend's `last_status`, when this tick observed one.
    pub last_status: Option<LastStatus>,
}

impl BackendScore {
    fn bare(score: f64) -> Self {
        Self {
            score,
            last_status: None,
        }
    }
}

/// Score one backend given the number of live tracked sessions on it.
pub fn score_backend(backend: &Backend, tracked: u64, criterion: &RankingCriterion) -> BackendScore {
    let status = &backend.status;
    if status.is_down {
        return BackendScore::bare(f64::NEG_INFINITY);
    }
    let metric = status.metric(criterion.metric);

    match criterion.normalization {
        Normalization::None => BackendScore::bare(-metric),
        Normalization::PerBackendConnection => {
            if status.connection_count == 0 {
                BackendScore::bare(f64::INFINITY)
            } else {
                BackendScore::bare(metric / status.connection_count as f64)
            }
        }
        Normalization::PerTrackedSession => {
            if tracked == 0 {
                return BackendScore::bare(f64::INFINITY);
            }
            let isolated = if criterion.isolates() {
                isolate_tracked_metric(metric, status.connection_count, tracked, &backend.last_status, criterion)
            } else {
                metric
            };
            BackendScore {
                score: isolated / tracked as f64,
                last_status: Some(LastStatus {
                    bps: status.bps,
                    tps: status.tps,
                    connection_count: status.connection_count,
                    tracked_client_count: tracked,
                    isolated_metric: isolated,
                }),
            }
        }
    }
}

/// Share of `metric` produced by the `tracked` sessions.
fn isolate_tracked_metric(
    metric: f64,
    connection_count: u64,
    tracked: u64,
    last: &LastStatus,
    criterion: &RankingCriterion,
) -> f64 {
    let background = connection_count.saturating_sub(tracked) as f64;
    let tracked = tracked as f64;
    let last_tracked = last.tracked_client_count as f64;
    let last_background = last.background_load() as f64;
    let last_metric = last.metric(criterion.metric);

    let det = tracked * last_background - background * last_tracked;
    if det != 0.0 {
        (metric * last_background - last_metric * last_tracked) / det
    } else {
        // Split the change in proportion to connection shares.
        let share = tracked / (tracked + background);
        last.isolated_metric + (metric - last_metric) * share
    }
}

/// Score every backend, apply carried-over status, and sort best first.
///
/// Ties keep input order. A NaN score ranks with the down backends.
pub fn rank_backends(
    backends: Vec<Backend>,
    tracked: &HashMap<BackendId, u64>,
    criterion: &RankingCriterion,
) -> Vec<Scored> {
    let mut scored: Vec<Scored> = backends
        .into_iter()
        .map(|mut backend| {
            let count = tracked.get(&backend.id).copied().unwrap_or(0);
            let outcome = score_backend(&backend, count, criterion);
            if let Some(last) = outcome.last_status {
                backend.last_status = last;
            }
            let score = if outcome.score.is_nan() {
                f64::NEG_INFINITY
            } else {
                outcome.score
            };
            Scored { backend, score }
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}
