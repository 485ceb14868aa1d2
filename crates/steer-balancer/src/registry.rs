//! Backend registry: the published view of every backend.
//!
//! The engine tick is the only writer. It builds a complete `Ranking` and
//! swaps it in; request handlers load the current one without locking and
//! never observe a half-updated backend list.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use steer_state::{Backend, BackendClass, Millis};

use crate::error::{BalancerError, BalancerResult};

/// A backend paired with the score it was ranked by.
#[derive(Debug, Clone, Serialize)]
pub struct Scored {
    pub backend: Backend,
    /// `+inf` for idle backends, `-inf` for down ones.
    pub score: f64,
}

/// One published snapshot of the backend pool.
#[derive(Debug, Clone, Serialize)]
pub struct Ranking {
    /// Edge-cache backends, best first.
    pub ranked: Vec<Scored>,
    /// The fallback origin. Never ranked, always up.
    pub last_resort: Backend,
    /// Mean cost per live session at the last tick.
    pub current_cost: f64,
    /// Active cost ceiling, if the controller is constraining.
    pub cost_ceiling: Option<f64>,
    /// Cheapest non-down per-session cost at the last tick.
    pub minimum_cost: Option<f64>,
    pub updated_at: Millis,
}

impl Ranking {
    /// Initial snapshot from stored backends, in storage order and unscored.
    pub fn initial(backends: Vec<Backend>) -> BalancerResult<Self> {
        let (origins, edges): (Vec<_>, Vec<_>) = backends
            .into_iter()
            .partition(|b| b.class == BackendClass::FallbackOrigin);
        let count = origins.len();
        let Ok([last_resort]) = <[Backend; 1]>::try_from(origins) else {
            return Err(BalancerError::LastResort(count));
        };

        Ok(Self {
            ranked: edges
                .into_iter()
                .map(|backend| Scored { backend, score: 0.0 })
                .collect(),
            last_resort,
            current_cost: 0.0,
            cost_ceiling: None,
            minimum_cost: None,
            updated_at: 0,
        })
    }

    /// Ranked backends in order, without scores.
    pub fn backends(&self) -> impl Iterator<Item = &Backend> {
        self.ranked.iter().map(|s| &s.backend)
    }

    /// Every backend, ranked ones first and the last resort at the end.
    pub fn all_backends(&self) -> impl Iterator<Item = &Backend> {
        self.backends().chain(std::iter::once(&self.last_resort))
    }

    /// Head of the ranking, if it is up.
    pub fn optimal(&self) -> Option<&Backend> {
        self.ranked
            .first()
            .map(|s| &s.backend)
            .filter(|b| !b.is_down())
    }

    pub fn find(&self, id: &str) -> Option<&Backend> {
        self.all_backends().find(|b| b.id == id)
    }
}

/// Lock-free holder of the current `Ranking`.
pub struct BackendRegistry {
    current: ArcSwap<Ranking>,
}

impl BackendRegistry {
    pub fn new(initial: Ranking) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<Ranking> {
        self.current.load_full()
    }

    /// Atomically replace the whole snapshot.
    pub fn publish(&self, ranking: Ranking) {
        self.current.store(Arc::new(ranking));
    }

    pub fn optimal(&self) -> Option<Backend> {
        self.current.load().optimal().cloned()
    }

    pub fn find(&self, id: &str) -> Option<Backend> {
        self.current.load().find(id).cloned()
    }
}
