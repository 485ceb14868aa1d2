//! Cost controller: blended per-session cost and the hysteresis ceiling.
//!
//! When the mean cost per live session climbs past the trigger point the
//! controller sets a ceiling that the selector applies to new placements.
//! The ceiling stays until the mean drops below it again.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use steer_state::{Backend, BackendId};

use crate::controls::Settings;

/// Cost figures computed on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CostSnapshot {
    pub current_cost: f64,
    pub cost_ceiling: Option<f64>,
    pub minimum_cost: Option<f64>,
}

/// Lowest cost among up, costed backends. Falls back to the last resort's cost.
pub fn minimum_cost<'a>(
    backends: impl IntoIterator<Item = &'a Backend>,
    last_resort: &Backend,
) -> Option<f64> {
    backends
        .into_iter()
        .filter(|b| b.class.costed() && !b.is_down())
        .filter_map(|b| b.cost)
        .min_by(f64::total_cmp)
        .or(last_resort.cost)
}

/// Mean cost above which the controller engages.
pub fn trigger_cost(minimum: f64, maximum: f64, trigger_ratio: f64) -> f64 {
    minimum + (maximum - minimum) * trigger_ratio
}

/// Ceiling applied once the controller engages.
pub fn set_cost(minimum: f64, maximum: f64, set_ratio: f64) -> f64 {
    if minimum < maximum {
        minimum + (maximum - minimum) * set_ratio
    } else {
        minimum
    }
}

/// Highest cost a backend may have to receive redistributed sessions.
pub fn redistribution_budget(minimum: f64, maximum: f64, trigger_ratio: f64) -> f64 {
    if minimum < maximum {
        trigger_cost(minimum, maximum, trigger_ratio)
    } else {
        minimum
    }
}

/// Holds the ceiling between ticks.
#[derive(Debug, Default)]
pub struct CostController {
    ceiling: Option<f64>,
}

impl CostController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ceiling(&self) -> Option<f64> {
        self.ceiling
    }

    /// Recompute the blended cost and move the ceiling.
    ///
    /// `live` maps backend ids to their live session counts. Only costed
    /// backends contribute to the blend.
    pub fn update(
        &mut self,
        backends: &[Backend],
        last_resort: &Backend,
        live: &HashMap<BackendId, u64>,
        settings: &Settings,
    ) -> CostSnapshot {
        let mut total_cost = 0.0;
        let mut total_sessions = 0u64;
        for backend in backends.iter().filter(|b| b.class.costed()) {
            let count = live.get(&backend.id).copied().unwrap_or(0);
            total_cost += backend.cost.unwrap_or(0.0) * count as f64;
            total_sessions += count;
        }

        let minimum = minimum_cost(backends, last_resort);
        if total_sessions == 0 {
            self.clear("no live sessions");
            return CostSnapshot {
                current_cost: 0.0,
                cost_ceiling: None,
                minimum_cost: minimum,
            };
        }
        let current = total_cost / total_sessions as f64;

        let Some(min) = minimum else {
            self.clear("no costed backend is up");
            return CostSnapshot {
                current_cost: current,
                cost_ceiling: None,
                minimum_cost: None,
            };
        };

        let max = settings.maximum_cost;
        match self.ceiling {
            None => {
                let trigger = trigger_cost(min, max, settings.trigger_ratio);
                if current > trigger {
                    let ceiling = set_cost(min, max, settings.set_ratio);
                    info!(current_cost = current, trigger, ceiling, "cost ceiling engaged");
                    self.ceiling = Some(ceiling);
                }
            }
            Some(ceiling) if current < ceiling => {
                info!(current_cost = current, ceiling, "cost ceiling released");
                self.ceiling = None;
            }
            Some(_) => {}
        }

        debug!(
            current_cost = current,
            minimum_cost = min,
            ceiling = ?self.ceiling,
            sessions = total_sessions,
            "cost recomputed"
        );

        CostSnapshot {
            current_cost: current,
            cost_ceiling: self.ceiling,
            minimum_cost: Some(min),
        }
    }

    fn clear(&mut self, reason: &str) {
        if let Some(ceiling) = self.ceiling.take() {
            info!(ceiling, reason, "cost ceiling released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steer_state::{BackendClass, BackendStatus, LastStatus};

    fn backend(id: &str, cost: Option<f64>, class: BackendClass) -> Backend {
        Backend {
            id: id.to_string(),
            name: id.to_string(),
            class,
            cost,
            telemetry_url: None,
            source_base_url: String::new(),
            status: BackendStatus::default(),
            last_status: LastStatus::default(),
        }
    }

    fn settings() -> Settings {
        Settings {
            maximum_cost: 2.0,
            trigger_ratio: 0.9,
            set_ratio: 0.5,
            ..Settings::default()
        }
    }

    /// Two edges at cost 1 and 3; `on_expensive` of 10 sessions sit on the
    /// cost-3 edge, so the mean is 1 + 0.2·on_expensive.
    fn step(controller: &mut CostController, on_expensive: u64) -> CostSnapshot {
        let edges = vec![
            backend("cheap", Some(1.0), BackendClass::EdgeCache),
            backend("pricey", Some(3.0), BackendClass::EdgeCache),
        ];
        let origin = backend("origin", None, BackendClass::FallbackOrigin);
        let live = HashMap::from([
            ("cheap".to_string(), 10 - on_expensive),
            ("pricey".to_string(), on_expensive),
        ]);
        controller.update(&edges, &origin, &live, &settings())
    }

    #[test]
    fn thresholds() {
        assert!((trigger_cost(1.0, 2.0, 0.9) - 1.9).abs() < 1e-12);
        assert_eq!(set_cost(1.0, 2.0, 0.5), 1.5);
        assert_eq!(set_cost(3.0, 2.0, 0.5), 3.0);
        assert!((redistribution_budget(1.0, 2.0, 0.9) - 1.9).abs() < 1e-12);
        assert_eq!(redistribution_budget(3.0, 2.0, 0.9), 3.0);
    }

    #[test]
    fn ceiling_hysteresis() {
        let mut controller = CostController::new();

        // 1.8 is below the 1.9 trigger.
        assert_eq!(step(&mut controller, 4).cost_ceiling, None);

        // 2.0 engages the ceiling at 1.5.
        let snap = step(&mut controller, 5);
        assert_eq!(snap.cost_ceiling, Some(1.5));
        assert_eq!(snap.minimum_cost, Some(1.0));

        // Between ceiling and trigger: held.
        assert_eq!(step(&mut controller, 3).cost_ceiling, Some(1.5));

        // 1.4 is below the ceiling: released.
        assert_eq!(step(&mut controller, 2).cost_ceiling, None);

        // 1.6 again: no re-trigger below 1.9.
        assert_eq!(step(&mut controller, 3).cost_ceiling, None);
    }

    #[test]
    fn no_sessions_clears_ceiling() {
        let mut controller = CostController::new();
        step(&mut controller, 5);
        assert!(controller.ceiling().is_some());

        let edges = vec![backend("cheap", Some(1.0), BackendClass::EdgeCache)];
        let origin = backend("origin", None, BackendClass::FallbackOrigin);
        let snap = controller.update(&edges, &origin, &HashMap::new(), &settings());
        assert_eq!(snap.current_cost, 0.0);
        assert_eq!(snap.cost_ceiling, None);
        assert!(controller.ceiling().is_none());
    }

    #[test]
    fn minimum_ignores_down_and_uncosted() {
        let mut down = backend("down", Some(0.1), BackendClass::EdgeCache);
        down.status = BackendStatus::down();
        let up = backend("up", Some(0.7), BackendClass::EdgeCache);
        let origin = backend("origin", Some(5.0), BackendClass::FallbackOrigin);

        assert_eq!(minimum_cost([&down, &up], &origin), Some(0.7));
        assert_eq!(minimum_cost([&down], &origin), Some(5.0));

        let free_origin = backend("origin", None, BackendClass::FallbackOrigin);
        assert_eq!(minimum_cost([&down], &free_origin), None);
    }

    #[test]
    fn all_edges_down_clears_ceiling() {
        let mut controller = CostController::new();
        step(&mut controller, 5);

        let mut edge = backend("cheap", Some(1.0), BackendClass::EdgeCache);
        edge.status = BackendStatus::down();
        let origin = backend("origin", None, BackendClass::FallbackOrigin);
        let live = HashMap::from([("cheap".to_string(), 3)]);
        let snap = controller.update(&[edge], &origin, &live, &settings());
        assert_eq!(snap.current_cost, 1.0);
        assert_eq!(snap.cost_ceiling, None);
    }
}
