//! steer.toml configuration parser.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{BackendClass, BackendId, RankingCriterion};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Poll/score/cost cadence (e.g. "1s").
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
    /// Timeout for a single telemetry request.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostConfig {
    #[serde(default = "default_maximum_cost")]
    pub maximum_cost: f64,
    #[serde(default = "default_trigger_ratio")]
    pub trigger_ratio: f64,
    #[serde(default = "default_set_ratio")]
    pub set_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long a session lives after its last request.
    #[serde(default = "default_session_ttl")]
    pub ttl: String,
    /// Gap between requests for one stream that counts as a stall.
    #[serde(default = "default_delay_threshold")]
    pub delay_threshold: String,
    /// Request timestamps kept per stream.
    #[serde(default = "default_history_len")]
    pub history_len: usize,
    /// How long expired sessions stay in storage before being reaped.
    #[serde(default = "default_reap_grace")]
    pub reap_grace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingConfig {
    #[serde(default)]
    pub criterion: RankingCriterion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: BackendId,
    pub name: String,
    pub class: BackendClass,
    pub cost: Option<f64>,
    pub telemetry_url: Option<String>,
    pub source_base_url: String,
}

fn default_tick_interval() -> String {
    "1s".to_string()
}

fn default_probe_timeout() -> String {
    "800ms".to_string()
}

fn default_maximum_cost() -> f64 {
    0.8
}

fn default_trigger_ratio() -> f64 {
    0.9
}

fn default_set_ratio() -> f64 {
    0.5
}

fn default_session_ttl() -> String {
    "10s".to_string()
}

fn default_delay_threshold() -> String {
    "4500ms".to_string()
}

fn default_history_len() -> usize {
    10
}

fn default_reap_grace() -> String {
    "60s".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            maximum_cost: default_maximum_cost(),
            trigger_ratio: default_trigger_ratio(),
            set_ratio: default_set_ratio(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: default_session_ttl(),
            delay_threshold: default_delay_threshold(),
            history_len: default_history_len(),
            reap_grace: default_reap_grace(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("engine.tick_interval", &self.tick_interval)
    }

    pub fn probe_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("engine.probe_timeout", &self.probe_timeout)
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Result<Duration, ConfigError> {
        duration_field("sessions.ttl", &self.ttl)
    }

    pub fn delay_threshold(&self) -> Result<Duration, ConfigError> {
        duration_field("sessions.delay_threshold", &self.delay_threshold)
    }

    pub fn reap_grace(&self) -> Result<Duration, ConfigError> {
        duration_field("sessions.reap_grace", &self.reap_grace)
    }
}

impl CostConfig {
    /// Check ratio ranges and cost sign.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_maximum_cost(self.maximum_cost)?;
        validate_trigger_ratio(self.trigger_ratio)?;
        validate_set_ratio(self.set_ratio)
    }
}

/// `maximum_cost` must be a finite, non-negative number.
pub fn validate_maximum_cost(value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid("cost.maximum_cost", format!("{value} is not a finite non-negative number")))
    }
}

/// `trigger_ratio` must lie in (0, 1].
pub fn validate_trigger_ratio(value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(invalid("cost.trigger_ratio", format!("{value} is outside (0, 1]")))
    }
}

/// `set_ratio` must lie in [0, 1].
pub fn validate_set_ratio(value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid("cost.set_ratio", format!("{value} is outside [0, 1]")))
    }
}

impl SteerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SteerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.tick_interval()?.is_zero() {
            return Err(invalid("engine.tick_interval", "must be greater than zero".to_string()));
        }
        if self.engine.probe_timeout()?.is_zero() {
            return Err(invalid("engine.probe_timeout", "must be greater than zero".to_string()));
        }
        self.sessions.ttl()?;
        self.sessions.delay_threshold()?;
        self.sessions.reap_grace()?;
        if self.sessions.history_len == 0 {
            return Err(invalid("sessions.history_len", "must be at least 1".to_string()));
        }
        self.cost.validate()?;

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::DuplicateBackend(backend.id.clone()));
            }
            let field = || format!("backends.{}", backend.id);
            if let Some(cost) = backend.cost
                && !(cost.is_finite() && cost >= 0.0)
            {
                return Err(invalid(field(), format!("cost {cost} is not a finite non-negative number")));
            }
            if backend.class.costed() && backend.cost.is_none() {
                return Err(invalid(field(), "edge-cache backends need a cost".to_string()));
            }
            if backend.class.pollable() && backend.telemetry_url.is_none() {
                return Err(invalid(field(), "edge-cache backends need a telemetry_url".to_string()));
            }
        }

        let last_resorts = self
            .backends
            .iter()
            .filter(|b| b.class == BackendClass::FallbackOrigin)
            .count();
        if last_resorts != 1 {
            return Err(ConfigError::LastResortCount(last_resorts));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn invalid(field: impl Into<String>, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason,
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, Normalization};

    const SAMPLE: &str = r#"
[engine]
tick_interval = "2s"

[cost]
maximum_cost = 2.0

[ranking]
criterion = "tps_per_connection"

[[backends]]
id = "edge-a"
name = "Edge A"
class = "edge-cache"
cost = 1.0
telemetry_url = "http://10.0.0.1:8080/status"
source_base_url = "http://10.0.0.1/live/"

[[backends]]
id = "origin"
name = "Origin"
class = "fallback-origin"
source_base_url = "http://origin/live/"
"#;

    #[test]
    fn parse_sample_with_defaults() {
        let config = SteerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.engine.tick_interval().unwrap(), Duration::from_secs(2));
        assert_eq!(config.engine.probe_timeout().unwrap(), Duration::from_millis(800));
        assert_eq!(config.cost.maximum_cost, 2.0);
        assert_eq!(config.cost.trigger_ratio, 0.9);
        assert_eq!(config.cost.set_ratio, 0.5);
        assert_eq!(config.sessions.ttl().unwrap(), Duration::from_secs(10));
        assert_eq!(config.sessions.delay_threshold().unwrap(), Duration::from_millis(4500));
        assert_eq!(config.sessions.history_len, 10);
        assert_eq!(config.ranking.criterion.metric, Metric::Tps);
        assert_eq!(
            config.ranking.criterion.normalization,
            Normalization::PerBackendConnection
        );
        assert_eq!(config.backends.len(), 2);
    }

    #[test]
    fn default_criterion_isolates_tracked_load() {
        let config = SteerConfig::from_toml_str(
            r#"
[[backends]]
id = "origin"
name = "Origin"
class = "fallback-origin"
source_base_url = "http://origin/"
"#,
        )
        .unwrap();
        assert!(config.ranking.criterion.isolates());
    }

    #[test]
    fn rejects_missing_last_resort() {
        let content = SAMPLE.replace("fallback-origin", "edge-cache");
        let err = SteerConfig::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. } | ConfigError::LastResortCount(0)));
    }

    #[test]
    fn rejects_two_last_resorts() {
        let content = format!(
            "{SAMPLE}\n[[backends]]\nid = \"origin-2\"\nname = \"Origin 2\"\nclass = \"fallback-origin\"\nsource_base_url = \"http://o2/\"\n"
        );
        let err = SteerConfig::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::LastResortCount(2)));
    }

    #[test]
    fn rejects_duplicate_backend_ids() {
        let content = SAMPLE.replace("id = \"origin\"", "id = \"edge-a\"");
        let err = SteerConfig::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateBackend(id) if id == "edge-a"));
    }

    #[test]
    fn rejects_edge_cache_without_cost() {
        let content = SAMPLE.replace("cost = 1.0\n", "");
        assert!(SteerConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn rejects_out_of_range_ratios() {
        let mut cost = CostConfig::default();
        cost.trigger_ratio = 0.0;
        assert!(cost.validate().is_err());

        let mut cost = CostConfig::default();
        cost.set_ratio = 1.5;
        assert!(cost.validate().is_err());

        let mut cost = CostConfig::default();
        cost.trigger_ratio = 1.0;
        cost.set_ratio = 0.0;
        assert!(cost.validate().is_ok());
    }

    #[test]
    fn rejects_bad_duration() {
        let content = SAMPLE.replace("\"2s\"", "\"soon\"");
        let err = SteerConfig::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { field: "engine.tick_interval", .. }));
    }

    #[test]
    fn rejects_zero_tick_interval() {
        for zero in ["\"0ms\"", "\"0s\""] {
            let content = SAMPLE.replace("\"2s\"", zero);
            let err = SteerConfig::from_toml_str(&content).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { field, .. } if field == "engine.tick_interval"),
                "{zero}: {err}"
            );
        }
    }

    #[test]
    fn rejects_zero_probe_timeout() {
        let content = SAMPLE.replace("tick_interval = \"2s\"", "tick_interval = \"2s\"\nprobe_timeout = \"0ms\"");
        let err = SteerConfig::from_toml_str(&content).unwrap_err();
        assert!(matches!(&err, ConfigError::InvalidValue { field, .. } if field == "engine.probe_timeout"));
    }

    #[test]
    fn huge_minute_duration_is_rejected() {
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX / 60)), Some(Duration::from_secs(u64::MAX / 60 * 60)));

        let content = SAMPLE.replace("\"2s\"", &format!("\"{}m\"", u64::MAX));
        let err = SteerConfig::from_toml_str(&content).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { field: "engine.tick_interval", .. }));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("fast"), None);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = SteerConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = SteerConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.backends.len(), 2);
        assert_eq!(reparsed.ranking.criterion, config.ranking.criterion);
    }
}
