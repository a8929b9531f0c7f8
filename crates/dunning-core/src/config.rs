//! Collections suite configuration.
//!
//! One TOML document configures every component: filesystem layout,
//! routing thresholds and field weights, heartbeat supervision, the
//! consistency checker, and the message queues. Loading always
//! validates; an invalid file never produces a half-usable config.
//!
//! # File Format
//!
//! ```toml
//! [paths]
//! state_dir = "/var/lib/dunning/state"
//! ledger_file = "/var/lib/dunning/ledger.md"
//! heartbeat_dir = "/var/lib/dunning/heartbeats"
//! queue_dir = "/var/lib/dunning/queues"
//!
//! [routing]
//! auto_threshold = 0.95
//! review_threshold = 0.85
//!
//! [routing.weights]
//! invoice_id = 0.30
//! amount = 0.30
//! due_date = 0.25
//! line_items = 0.15
//!
//! [health]
//! heartbeat_timeout = "1h"
//! escalation_threshold = 2
//! history_window = 10
//! agents = ["email_parser", "payment_watcher"]
//!
//! [consistency]
//! tolerance_cents = 1
//! queue_depth_ceiling = 100
//!
//! [queue]
//! consumers = ["emailer", "payment_watcher"]
//! dedupe_window = "24h"
//! ```
//!
//! Only `[paths]` is required; every other section falls back to the
//! defaults shown above. The weight values are the tuning the suite
//! shipped with and changing them is a config decision, not a code
//! change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Weight sums are accepted within this slack of 1.0.
pub const WEIGHT_SUM_EPSILON: f64 = 1e-6;

const fn default_auto_threshold() -> f64 {
    0.95
}

const fn default_review_threshold() -> f64 {
    0.85
}

const fn default_invoice_id_weight() -> f64 {
    0.30
}

const fn default_amount_weight() -> f64 {
    0.30
}

const fn default_due_date_weight() -> f64 {
    0.25
}

const fn default_line_items_weight() -> f64 {
    0.15
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

const fn default_escalation_threshold() -> u32 {
    2
}

const fn default_history_window() -> usize {
    10
}

fn default_agents() -> Vec<String> {
    vec!["email_parser".to_string(), "payment_watcher".to_string()]
}

const fn default_tolerance_cents() -> i64 {
    1
}

const fn default_queue_depth_ceiling() -> usize {
    100
}

fn default_consumers() -> Vec<String> {
    vec!["emailer".to_string(), "payment_watcher".to_string()]
}

const fn default_dedupe_window() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has unknown/invalid fields.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered back to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Config parsed but violates a semantic constraint.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Filesystem layout. The only required section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory of active invoice records (the archive lives inside).
    pub state_dir: PathBuf,
    /// Path of the human-readable ledger file.
    pub ledger_file: PathBuf,
    /// Directory of agent heartbeat files.
    pub heartbeat_dir: PathBuf,
    /// Directory of per-consumer message queues.
    pub queue_dir: PathBuf,
}

/// Per-field confidence weights used when scoring a parsed invoice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldWeights {
    /// Weight of the extracted invoice id.
    #[serde(default = "default_invoice_id_weight")]
    pub invoice_id: f64,
    /// Weight of the extracted amount.
    #[serde(default = "default_amount_weight")]
    pub amount: f64,
    /// Weight of the extracted due date.
    #[serde(default = "default_due_date_weight")]
    pub due_date: f64,
    /// Weight of the extracted line items.
    #[serde(default = "default_line_items_weight")]
    pub line_items: f64,
}

impl FieldWeights {
    /// Sum of all four weights.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.invoice_id + self.amount + self.due_date + self.line_items
    }
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            invoice_id: default_invoice_id_weight(),
            amount: default_amount_weight(),
            due_date: default_due_date_weight(),
            line_items: default_line_items_weight(),
        }
    }
}

/// Confidence routing thresholds and weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    /// Weighted confidence at or above this routes automatically.
    #[serde(default = "default_auto_threshold")]
    pub auto_threshold: f64,
    /// Weighted confidence at or above this (but below auto) is held
    /// for review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
    /// Per-field weights.
    #[serde(default)]
    pub weights: FieldWeights,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            auto_threshold: default_auto_threshold(),
            review_threshold: default_review_threshold(),
            weights: FieldWeights::default(),
        }
    }
}

/// Heartbeat supervision tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// A heartbeat older than this is stale.
    #[serde(default = "default_heartbeat_timeout", with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Consecutive stale checks before escalation.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
    /// Check-history entries consulted when counting consecutive
    /// staleness.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Agents supervised from startup. Others can be registered at
    /// runtime.
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: default_heartbeat_timeout(),
            escalation_threshold: default_escalation_threshold(),
            history_window: default_history_window(),
            agents: default_agents(),
        }
    }
}

/// Consistency checker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsistencyConfig {
    /// Store/ledger totals may differ by up to this many cents.
    #[serde(default = "default_tolerance_cents")]
    pub tolerance_cents: i64,
    /// Queue depth at or above this is flagged.
    #[serde(default = "default_queue_depth_ceiling")]
    pub queue_depth_ceiling: usize,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            tolerance_cents: default_tolerance_cents(),
            queue_depth_ceiling: default_queue_depth_ceiling(),
        }
    }
}

/// Message queue tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Consumers that get a queue at startup.
    #[serde(default = "default_consumers")]
    pub consumers: Vec<String>,
    /// Producer-side duplicate sends are suppressed within this window.
    #[serde(default = "default_dedupe_window", with = "humantime_serde")]
    pub dedupe_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            consumers: default_consumers(),
            dedupe_window: default_dedupe_window(),
        }
    }
}

/// Root configuration for the whole suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectionsConfig {
    /// Filesystem layout (required).
    pub paths: PathsConfig,
    /// Routing thresholds and weights.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Heartbeat supervision.
    #[serde(default)]
    pub health: HealthConfig,
    /// Consistency checking.
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    /// Message queues.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl CollectionsConfig {
    /// Config with the given paths and every tunable at its default.
    #[must_use]
    pub fn with_paths(paths: PathsConfig) -> Self {
        Self {
            paths,
            routing: RoutingConfig::default(),
            health: HealthConfig::default(),
            consistency: ConsistencyConfig::default(),
            queue: QueueConfig::default(),
        }
    }

    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if parsing or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the config back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if rendering fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check semantic constraints that the type system cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = &self.routing.weights;
        for (name, value) in [
            ("invoice_id", weights.invoice_id),
            ("amount", weights.amount),
            ("due_date", weights.due_date),
            ("line_items", weights.line_items),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Validation(format!(
                    "routing.weights.{name} must be in [0.0, 1.0], got {value}"
                )));
            }
        }
        let sum = weights.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(ConfigError::Validation(format!(
                "routing.weights must sum to 1.0, got {sum}"
            )));
        }

        let auto = self.routing.auto_threshold;
        let review = self.routing.review_threshold;
        if !auto.is_finite() || !review.is_finite() || review <= 0.0 || review > auto || auto > 1.0
        {
            return Err(ConfigError::Validation(format!(
                "routing thresholds must satisfy 0 < review_threshold <= auto_threshold <= 1, \
                 got review={review} auto={auto}"
            )));
        }

        if self.health.heartbeat_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "health.heartbeat_timeout must be positive".to_string(),
            ));
        }
        if self.health.escalation_threshold == 0 {
            return Err(ConfigError::Validation(
                "health.escalation_threshold must be at least 1".to_string(),
            ));
        }
        if self.health.history_window <= self.health.escalation_threshold as usize {
            return Err(ConfigError::Validation(format!(
                "health.history_window ({}) must exceed escalation_threshold ({})",
                self.health.history_window, self.health.escalation_threshold
            )));
        }
        for agent in &self.health.agents {
            if !crate::store::is_safe_component(agent) {
                return Err(ConfigError::Validation(format!(
                    "health.agents entry {agent:?} is not a safe name"
                )));
            }
        }

        if self.consistency.tolerance_cents < 0 {
            return Err(ConfigError::Validation(
                "consistency.tolerance_cents must not be negative".to_string(),
            ));
        }
        if self.consistency.queue_depth_ceiling == 0 {
            return Err(ConfigError::Validation(
                "consistency.queue_depth_ceiling must be at least 1".to_string(),
            ));
        }

        for consumer in &self.queue.consumers {
            if !crate::store::is_safe_component(consumer) {
                return Err(ConfigError::Validation(format!(
                    "queue.consumers entry {consumer:?} is not a safe name"
                )));
            }
        }
        if self.queue.dedupe_window.is_zero() {
            return Err(ConfigError::Validation(
                "queue.dedupe_window must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[paths]
state_dir = "/var/lib/dunning/state"
ledger_file = "/var/lib/dunning/ledger.md"
heartbeat_dir = "/var/lib/dunning/heartbeats"
queue_dir = "/var/lib/dunning/queues"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = CollectionsConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.routing.auto_threshold, 0.95);
        assert_eq!(config.routing.review_threshold, 0.85);
        assert_eq!(config.routing.weights.invoice_id, 0.30);
        assert_eq!(config.routing.weights.amount, 0.30);
        assert_eq!(config.routing.weights.due_date, 0.25);
        assert_eq!(config.routing.weights.line_items, 0.15);
        assert_eq!(
            config.health.heartbeat_timeout,
            Duration::from_secs(60 * 60)
        );
        assert_eq!(config.health.escalation_threshold, 2);
        assert_eq!(config.health.history_window, 10);
        assert_eq!(config.consistency.tolerance_cents, 1);
        assert_eq!(config.consistency.queue_depth_ceiling, 100);
        assert_eq!(config.queue.consumers, vec!["emailer", "payment_watcher"]);
        assert_eq!(
            config.queue.dedupe_window,
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[test]
    fn test_missing_paths_section_rejected() {
        let result = CollectionsConfig::from_toml("[routing]\nauto_threshold = 0.9\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let content = format!("{MINIMAL}\n[routing]\nmystery_knob = 3\n");
        let result = CollectionsConfig::from_toml(&content);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let content = format!(
            "{MINIMAL}\n[routing.weights]\ninvoice_id = 0.5\namount = 0.5\ndue_date = 0.5\nline_items = 0.5\n"
        );
        let result = CollectionsConfig::from_toml(&content);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_review_above_auto_rejected() {
        let content = format!(
            "{MINIMAL}\n[routing]\nauto_threshold = 0.8\nreview_threshold = 0.9\n"
        );
        let result = CollectionsConfig::from_toml(&content);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_history_window_must_exceed_threshold() {
        let content = format!(
            "{MINIMAL}\n[health]\nescalation_threshold = 5\nhistory_window = 5\n"
        );
        let result = CollectionsConfig::from_toml(&content);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unsafe_agent_name_rejected() {
        let content = format!("{MINIMAL}\n[health]\nagents = [\"../evil\"]\n");
        let result = CollectionsConfig::from_toml(&content);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_humantime_round_trip() {
        let content = format!("{MINIMAL}\n[health]\nheartbeat_timeout = \"90s\"\n");
        let config = CollectionsConfig::from_toml(&content).unwrap();
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(90));

        let rendered = config.to_toml().unwrap();
        let reparsed = CollectionsConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("collections.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = CollectionsConfig::from_file(&path).unwrap();
        assert_eq!(
            config.paths.state_dir,
            PathBuf::from("/var/lib/dunning/state")
        );

        let missing = CollectionsConfig::from_file(tmp.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
