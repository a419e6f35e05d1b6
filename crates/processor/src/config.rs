//! Processor configuration
//!
//! Durations are written in humantime form (`"30m"`, `"5s"`) and every
//! field has a default, so an empty JSON object is a valid configuration.

use crate::error::ConfigError;
use crate::publisher::RetryPolicy;
use crate::watermark::TimeDomain;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// When forecast invocations are requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Request a forecast when a forecast window closes
    #[default]
    OnWindowClose,
    /// Request a forecast on every update and run it on the scheduler cadence
    Cadence,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Configuration for the stream processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Tumbling window size for per-SKU demand totals
    #[serde(with = "humantime_serde", default = "default_window_size_forecast")]
    pub window_size_forecast: Duration,

    /// Window size for anomaly baselines
    #[serde(with = "humantime_serde", default = "default_window_size_anomaly_stats")]
    pub window_size_anomaly_stats: Duration,

    /// Slide for anomaly baselines; tumbling when absent
    #[serde(with = "humantime_serde::option", default)]
    pub anomaly_slide: Option<Duration>,

    /// Tumbling window size for sentiment counts
    #[serde(with = "humantime_serde", default = "default_window_size_sentiment")]
    pub window_size_sentiment: Duration,

    /// Grace period after a window end during which late events are admitted
    #[serde(with = "humantime_serde", default = "default_lateness_tolerance")]
    pub lateness_tolerance: Duration,

    /// Global z-score threshold
    #[serde(default = "default_anomaly_z_threshold")]
    pub anomaly_z_threshold: f64,

    /// Per partition key threshold overrides
    #[serde(default)]
    pub anomaly_threshold_overrides: HashMap<String, f64>,

    /// Minimum baseline samples before an event can be flagged
    #[serde(default = "default_anomaly_min_samples")]
    pub anomaly_min_samples: u64,

    /// Scheduler period for window-close checks and trigger dispatch
    #[serde(with = "humantime_serde", default = "default_trigger_cadence_interval")]
    pub trigger_cadence_interval: Duration,

    /// When forecast triggers are requested
    #[serde(default)]
    pub trigger_policy: TriggerPolicy,

    /// Closed forecast windows kept per key as forecast input
    #[serde(default = "default_retained_history")]
    pub retained_history: usize,

    /// Cross-key bound on concurrently running invocations
    #[serde(default = "default_max_concurrent_triggers")]
    pub max_concurrent_triggers: usize,

    /// Invocations that may wait for a free slot
    #[serde(default = "default_trigger_queue_capacity")]
    pub trigger_queue_capacity: usize,

    /// Clock driving the watermark
    #[serde(default)]
    pub time_domain: TimeDomain,

    /// Sink retry behaviour
    #[serde(default)]
    pub sink_retry: RetryPolicy,

    /// Buffer between each input feed and its ingestion worker
    #[serde(default = "default_ingest_channel_capacity")]
    pub ingest_channel_capacity: usize,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_window_size_forecast() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_window_size_anomaly_stats() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_window_size_sentiment() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_lateness_tolerance() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_anomaly_z_threshold() -> f64 {
    3.0
}

fn default_anomaly_min_samples() -> u64 {
    2
}

fn default_trigger_cadence_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retained_history() -> usize {
    48
}

fn default_max_concurrent_triggers() -> usize {
    4
}

fn default_trigger_queue_capacity() -> usize {
    64
}

fn default_ingest_channel_capacity() -> usize {
    1024
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            window_size_forecast: default_window_size_forecast(),
            window_size_anomaly_stats: default_window_size_anomaly_stats(),
            anomaly_slide: None,
            window_size_sentiment: default_window_size_sentiment(),
            lateness_tolerance: default_lateness_tolerance(),
            anomaly_z_threshold: default_anomaly_z_threshold(),
            anomaly_threshold_overrides: HashMap::new(),
            anomaly_min_samples: default_anomaly_min_samples(),
            trigger_cadence_interval: default_trigger_cadence_interval(),
            trigger_policy: TriggerPolicy::default(),
            retained_history: default_retained_history(),
            max_concurrent_triggers: default_max_concurrent_triggers(),
            trigger_queue_capacity: default_trigger_queue_capacity(),
            time_domain: TimeDomain::default(),
            sink_retry: RetryPolicy::default(),
            ingest_channel_capacity: default_ingest_channel_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, size) in [
            ("window_size_forecast", self.window_size_forecast),
            ("window_size_anomaly_stats", self.window_size_anomaly_stats),
            ("window_size_sentiment", self.window_size_sentiment),
        ] {
            if size.as_millis() == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at least 1ms"
                )));
            }
            check_representable(name, size)?;
        }
        check_representable("lateness_tolerance", self.lateness_tolerance)?;

        if let Some(slide) = self.anomaly_slide {
            if slide.as_millis() == 0 || slide > self.window_size_anomaly_stats {
                return Err(ConfigError::Invalid(
                    "anomaly_slide must be in (0, window_size_anomaly_stats]".to_string(),
                ));
            }
        }

        if !(self.anomaly_z_threshold.is_finite() && self.anomaly_z_threshold > 0.0) {
            return Err(ConfigError::Invalid(
                "anomaly_z_threshold must be a positive number".to_string(),
            ));
        }
        if let Some((key, threshold)) = self
            .anomaly_threshold_overrides
            .iter()
            .find(|(_, t)| !(t.is_finite() && **t > 0.0))
        {
            return Err(ConfigError::Invalid(format!(
                "threshold override for '{key}' must be positive, got {threshold}"
            )));
        }
        if self.anomaly_min_samples < 2 {
            return Err(ConfigError::Invalid(
                "anomaly_min_samples must be at least 2".to_string(),
            ));
        }
        if self.trigger_cadence_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "trigger_cadence_interval must be non-zero".to_string(),
            ));
        }
        if self.retained_history == 0 {
            return Err(ConfigError::Invalid(
                "retained_history must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_triggers == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_triggers must be at least 1".to_string(),
            ));
        }
        if self.ingest_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "ingest_channel_capacity must be at least 1".to_string(),
            ));
        }
        self.sink_retry.validate()?;
        Ok(())
    }

    /// Threshold for a partition key, falling back to the global default
    pub fn threshold_for(&self, partition_key: &str) -> f64 {
        self.anomaly_threshold_overrides
            .get(partition_key)
            .copied()
            .unwrap_or(self.anomaly_z_threshold)
    }

    pub fn forecast_window(&self) -> chrono::Duration {
        to_chrono(self.window_size_forecast)
    }

    pub fn anomaly_window(&self) -> chrono::Duration {
        to_chrono(self.window_size_anomaly_stats)
    }

    pub fn anomaly_slide_window(&self) -> Option<chrono::Duration> {
        self.anomaly_slide.map(to_chrono)
    }

    pub fn sentiment_window(&self) -> chrono::Duration {
        to_chrono(self.window_size_sentiment)
    }

    pub fn lateness(&self) -> chrono::Duration {
        to_chrono(self.lateness_tolerance)
    }
}

fn check_representable(name: &str, value: Duration) -> Result<(), ConfigError> {
    chrono::Duration::from_std(value)
        .map(|_| ())
        .map_err(|_| ConfigError::Invalid(format!("{name} is out of range")))
}

// Values are range-checked by `validate`.
fn to_chrono(value: Duration) -> chrono::Duration {
    chrono::Duration::from_std(value).unwrap_or_else(|_| chrono::Duration::zero())
}
