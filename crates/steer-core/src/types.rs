//! Shared types used across Steer crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Stable identifier of a backend (CDN).
pub type BackendId = String;

/// Identifier of a client session.
pub type SessionId = String;

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Current wall-clock time in milliseconds.
pub fn epoch_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Millis
}

// ── Backend class ──────────────────────────────────────────────────

/// The kind of backend, which decides how the engine treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendClass {
    /// A metered edge cache with a telemetry endpoint.
    EdgeCache,
    /// The origin of last resort. Never polled, always considered up.
    FallbackOrigin,
}

impl BackendClass {
    /// Whether the health poller queries this class of backend.
    pub fn pollable(self) -> bool {
        matches!(self, BackendClass::EdgeCache)
    }

    /// Whether backends of this class must carry a cost.
    pub fn costed(self) -> bool {
        matches!(self, BackendClass::EdgeCache)
    }
}

// ── Ranking criterion ──────────────────────────────────────────────

/// Raw telemetry metric a backend is ranked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Bps,
    Tps,
    ConnectionCount,
}

impl Metric {
    pub fn label(self) -> &'static str {
        match self {
            Metric::Bps => "bps",
            Metric::Tps => "tps",
            Metric::ConnectionCount => "connection_count",
        }
    }
}

/// How the raw metric is normalized before ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Rank on the raw metric, lower load first.
    None,
    /// Divide by the backend's total connection count.
    PerBackendConnection,
    /// Divide by the number of tracked sessions assigned to the backend.
    PerTrackedSession,
}

/// Configured ranking criterion.
///
/// Deserializes either from a compact name such as `"bps_mm_per_client"`
/// or from explicit fields:
///
/// ```toml
/// [ranking.criterion]
/// metric = "tps"
/// normalization = "per_tracked_session"
/// isolate_tracked_load = true
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CriterionRepr")]
pub struct RankingCriterion {
    pub metric: Metric,
    pub normalization: Normalization,
    /// Only meaningful with `PerTrackedSession`.
    pub isolate_tracked_load: bool,
}

impl RankingCriterion {
    pub fn new(metric: Metric, normalization: Normalization, isolate_tracked_load: bool) -> Self {
        Self {
            metric,
            normalization,
            isolate_tracked_load,
        }
    }

    /// Whether the scorer runs the two-tick load decomposition.
    pub fn isolates(&self) -> bool {
        self.isolate_tracked_load && self.normalization == Normalization::PerTrackedSession
    }
}

impl Default for RankingCriterion {
    fn default() -> Self {
        Self::new(Metric::Bps, Normalization::PerTrackedSession, true)
    }
}

impl FromStr for RankingCriterion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (metric, rest) = if let Some(rest) = s.strip_prefix("bps") {
            (Metric::Bps, rest)
        } else if let Some(rest) = s.strip_prefix("tps") {
            (Metric::Tps, rest)
        } else if let Some(rest) = s.strip_prefix("connection_count") {
            (Metric::ConnectionCount, rest)
        } else {
            return Err(ConfigError::InvalidCriterion(s.to_string()));
        };

        let (normalization, isolate) = match rest {
            "" => (Normalization::None, false),
            "_per_connection" => (Normalization::PerBackendConnection, false),
            "_per_client" => (Normalization::PerTrackedSession, false),
            "_mm_per_client" => (Normalization::PerTrackedSession, true),
            _ => return Err(ConfigError::InvalidCriterion(s.to_string())),
        };

        Ok(Self::new(metric, normalization, isolate))
    }
}

impl fmt::Display for RankingCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match (self.normalization, self.isolates()) {
            (Normalization::None, _) => "",
            (Normalization::PerBackendConnection, _) => "_per_connection",
            (Normalization::PerTrackedSession, false) => "_per_client",
            (Normalization::PerTrackedSession, true) => "_mm_per_client",
        };
        write!(f, "{}{suffix}", self.metric.label())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CriterionRepr {
    Name(String),
    Fields {
        metric: Metric,
        normalization: Normalization,
        #[serde(default)]
        isolate_tracked_load: bool,
    },
}

impl TryFrom<CriterionRepr> for RankingCriterion {
    type Error = ConfigError;

    fn try_from(repr: CriterionRepr) -> Result<Self, Self::Error> {
        match repr {
            CriterionRepr::Name(name) => name.parse(),
            CriterionRepr::Fields {
                metric,
                normalization,
                isolate_tracked_load,
            } => Ok(Self::new(metric, normalization, isolate_tracked_load)),
        }
    }
}
