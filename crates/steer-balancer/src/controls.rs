//! Runtime-adjustable engine settings.
//!
//! Settings are read once per tick and once per request, so a change takes
//! effect on the next one of either. The whole set is swapped atomically.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use steer_core::config::{validate_maximum_cost, validate_set_ratio, validate_trigger_ratio};
use steer_core::{ConfigError, RankingCriterion, SteerConfig};

use crate::error::BalancerResult;

/// Current values of every administrative control.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub maximum_cost: f64,
    pub trigger_ratio: f64,
    pub set_ratio: f64,
    pub delay_threshold_ms: u64,
    pub criterion: RankingCriterion,
}

impl Settings {
    pub fn from_config(config: &SteerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            maximum_cost: config.cost.maximum_cost,
            trigger_ratio: config.cost.trigger_ratio,
            set_ratio: config.cost.set_ratio,
            delay_threshold_ms: config.sessions.delay_threshold()?.as_millis() as u64,
            criterion: config.ranking.criterion,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            maximum_cost: 0.8,
            trigger_ratio: 0.9,
            set_ratio: 0.5,
            delay_threshold_ms: 4_500,
            criterion: RankingCriterion::default(),
        }
    }
}

/// A partial update, as accepted by the controls API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlsUpdate {
    pub maximum_cost: Option<f64>,
    pub trigger_ratio: Option<f64>,
    pub set_ratio: Option<f64>,
    pub delay_threshold_ms: Option<u64>,
    pub criterion: Option<RankingCriterion>,
}

/// Shared handle to the engine settings.
pub struct Controls {
    settings: ArcSwap<Settings>,
}

impl Controls {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
        }
    }

    pub fn current(&self) -> Settings {
        **self.settings.load()
    }

    pub fn set_maximum_cost(&self, value: f64) -> BalancerResult<()> {
        self.apply(&ControlsUpdate {
            maximum_cost: Some(value),
            ..ControlsUpdate::default()
        })
        .map(|_| ())
    }

    pub fn set_trigger_ratio(&self, value: f64) -> BalancerResult<()> {
        self.apply(&ControlsUpdate {
            trigger_ratio: Some(value),
            ..ControlsUpdate::default()
        })
        .map(|_| ())
    }

    pub fn set_set_ratio(&self, value: f64) -> BalancerResult<()> {
        self.apply(&ControlsUpdate {
            set_ratio: Some(value),
            ..ControlsUpdate::default()
        })
        .map(|_| ())
    }

    pub fn set_delay_threshold(&self, value: Duration) -> BalancerResult<()> {
        self.apply(&ControlsUpdate {
            delay_threshold_ms: Some(value.as_millis() as u64),
            ..ControlsUpdate::default()
        })
        .map(|_| ())
    }

    pub fn set_criterion(&self, criterion: RankingCriterion) -> BalancerResult<()> {
        self.apply(&ControlsUpdate {
            criterion: Some(criterion),
            ..ControlsUpdate::default()
        })
        .map(|_| ())
    }

    /// Validate every field of `update`, then swap them all in together.
    ///
    /// Nothing changes if any field is rejected.
    pub fn apply(&self, update: &ControlsUpdate) -> BalancerResult<Settings> {
        if let Some(v) = update.maximum_cost {
            validate_maximum_cost(v)?;
        }
        if let Some(v) = update.trigger_ratio {
            validate_trigger_ratio(v)?;
        }
        if let Some(v) = update.set_ratio {
            validate_set_ratio(v)?;
        }

        let previous = self.settings.rcu(|current| {
            let mut next = **current;
            if let Some(v) = update.maximum_cost {
                next.maximum_cost = v;
            }
            if let Some(v) = update.trigger_ratio {
                next.trigger_ratio = v;
            }
            if let Some(v) = update.set_ratio {
                next.set_ratio = v;
            }
            if let Some(v) = update.delay_threshold_ms {
                next.delay_threshold_ms = v;
            }
            if let Some(v) = update.criterion {
                next.criterion = v;
            }
            Arc::new(next)
        });

        let next = self.current();
        if *previous != next {
            info!(
                maximum_cost = next.maximum_cost,
                trigger_ratio = next.trigger_ratio,
                set_ratio = next.set_ratio,
                delay_threshold_ms = next.delay_threshold_ms,
                criterion = %next.criterion,
                "controls updated"
            );
        }
        Ok(next)
    }
}

impl Default for Controls {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
