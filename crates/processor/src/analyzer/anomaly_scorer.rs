//! Anomaly Scorer
//!
//! Scores each sale against the live statistics of the windows it falls in.
//! Scoring must run *before* the event's own value is folded into the
//! statistics, so a spike never dampens the baseline used to judge it.
//!
//! With sliding baselines an event is scored once per window it belongs to;
//! each window reports independently and duplicates are left to consumers.

use crate::aggregation::AggregateStats;
use crate::config::ProcessorConfig;
use crate::core::Event;
use crate::metrics::PipelineMetrics;
use crate::window::WindowRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Configuration for the anomaly scorer
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyScorerConfig {
    /// Flag when |z| exceeds this value
    pub z_threshold: f64,
    /// Per partition key overrides of `z_threshold`
    pub threshold_overrides: HashMap<String, f64>,
    /// Baseline samples required before scoring
    pub min_samples: u64,
}

impl Default for AnomalyScorerConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            threshold_overrides: HashMap::new(),
            min_samples: 2,
        }
    }
}

impl From<&ProcessorConfig> for AnomalyScorerConfig {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            z_threshold: config.anomaly_z_threshold,
            threshold_overrides: config.anomaly_threshold_overrides.clone(),
            min_samples: config.anomaly_min_samples,
        }
    }
}

/// Severity of an anomaly, by |z|
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn from_z_score(z: f64) -> Self {
        let z = z.abs();
        if z > 5.0 {
            Severity::Critical
        } else if z > 4.0 {
            Severity::Error
        } else {
            Severity::Warning
        }
    }
}

/// A flagged event. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub event_time: DateTime<Utc>,
    pub partition_key: String,
    pub observed_value: f64,
    pub mean_at_time: f64,
    pub stddev_at_time: f64,
    /// Infinite when the baseline has zero variance
    pub z_score: f64,
    pub severity: Severity,
    pub store_id: Option<String>,
    /// Baseline window the event was scored against
    pub window_ref: WindowRef,
    /// Source offset of the scored event
    pub offset: u64,
}

impl AnomalyRecord {
    /// Stable identity: one record per event per baseline window
    ///
    /// Event time is part of the key so events built without a source
    /// offset still get distinct records.
    pub fn record_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.partition_key,
            self.event_time.timestamp_millis(),
            self.offset,
            self.window_ref.bounds.start_millis()
        )
    }
}

/// Result of scoring one event against one baseline
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    /// Deviation exceeded the threshold
    Anomalous(AnomalyRecord),
    /// Within the threshold
    Normal { z_score: f64 },
    /// Baseline too small or standard deviation undefined; never flags
    InsufficientStatistics,
}

/// Z-score anomaly scorer
pub struct AnomalyScorer {
    config: AnomalyScorerConfig,
    metrics: Arc<PipelineMetrics>,
}

impl AnomalyScorer {
    pub fn new(config: AnomalyScorerConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &AnomalyScorerConfig {
        &self.config
    }

    pub fn threshold_for(&self, partition_key: &str) -> f64 {
        self.config
            .threshold_overrides
            .get(partition_key)
            .copied()
            .unwrap_or(self.config.z_threshold)
    }

    /// Score `event` against `stats`, returning a record when it is anomalous
    pub fn score(&self, event: &Event, stats: &AggregateStats) -> Option<AnomalyRecord> {
        match self.evaluate(event, stats) {
            ScoreOutcome::Anomalous(record) => Some(record),
            _ => None,
        }
    }

    /// Full scoring outcome for `event` against the pre-update `stats`
    pub fn evaluate(&self, event: &Event, stats: &AggregateStats) -> ScoreOutcome {
        let Some(value) = event.quantity() else {
            return ScoreOutcome::InsufficientStatistics;
        };

        let stddev = match stats.stddev() {
            Some(stddev) if stats.count >= self.config.min_samples => stddev,
            _ => {
                self.metrics.record_insufficient_statistics();
                trace!(
                    partition_key = %event.partition_key,
                    samples = stats.count,
                    "Insufficient statistics, skipping anomaly scoring"
                );
                return ScoreOutcome::InsufficientStatistics;
            }
        };

        let deviation = value - stats.mean;
        let threshold = self.threshold_for(&event.partition_key);
        // Zero variance: any differing value is infinitely far from the mean
        let z_score = if stddev > 0.0 {
            deviation / stddev
        } else if deviation == 0.0 {
            0.0
        } else {
            f64::INFINITY.copysign(deviation)
        };

        if deviation.abs() <= threshold * stddev {
            return ScoreOutcome::Normal { z_score };
        }

        let record = AnomalyRecord {
            event_time: event.event_time,
            partition_key: event.partition_key.clone(),
            observed_value: value,
            mean_at_time: stats.mean,
            stddev_at_time: stddev,
            z_score,
            severity: Severity::from_z_score(z_score),
            store_id: event.store_id().map(str::to_string),
            window_ref: stats.window_ref.clone(),
            offset: event.offset,
        };
        self.metrics.record_anomaly_flagged();
        debug!(
            partition_key = %record.partition_key,
            value,
            mean = record.mean_at_time,
            stddev,
            z_score,
            threshold,
            "Anomaly detected"
        );
        ScoreOutcome::Anomalous(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{WindowBounds, WindowFamily};
    use chrono::TimeZone;
    use prometheus_client::registry::Registry;

    fn scorer(config: AnomalyScorerConfig) -> AnomalyScorer {
        AnomalyScorer::new(config, Arc::new(PipelineMetrics::new(&mut Registry::default())))
    }

    fn baseline() -> AggregateStats {
        AggregateStats::new(WindowRef::new(
            WindowFamily::AnomalyStats,
            "A",
            WindowBounds::from_millis(0, 1_800_000).unwrap(),
        ))
    }

    fn sale(minute: i64, quantity: f64) -> Event {
        Event::sale(
            Utc.timestamp_millis_opt(minute * 60_000).unwrap(),
            "A",
            quantity,
            1.0,
            "s1",
        )
        .with_offset(minute as u64)
    }

    /// Score every value before folding it in, like the processor does
    fn run(scorer: &AnomalyScorer, values: &[f64]) -> Vec<ScoreOutcome> {
        let mut stats = baseline();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let outcome = scorer.evaluate(&sale(i as i64, *v), &stats);
                stats.update(*v);
                outcome
            })
            .collect()
    }

    #[test]
    fn test_spike_is_scored_pre_update() {
        let scorer = scorer(AnomalyScorerConfig::default());
        let outcomes = run(&scorer, &[10.0, 10.0, 10.0, 10.0, 100.0]);

        assert!(outcomes[..4]
            .iter()
            .all(|o| !matches!(o, ScoreOutcome::Anomalous(_))));
        let ScoreOutcome::Anomalous(record) = &outcomes[4] else {
            panic!("expected anomaly, got {:?}", outcomes[4]);
        };
        // The baseline excludes the spike itself
        assert_eq!(record.mean_at_time, 10.0);
        assert_eq!(record.stddev_at_time, 0.0);
        assert_eq!(record.z_score, f64::INFINITY);
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.offset, 4);
    }

    #[test]
    fn test_z_score_uses_sample_stddev() {
        let scorer = scorer(AnomalyScorerConfig::default());
        let values = [4.0, 6.0, 5.0, 5.0, 4.0, 6.0, 5.0, 5.0, 5.0, 50.0];
        let outcomes = run(&scorer, &values);

        let prior = &values[..9];
        let mean = prior.iter().sum::<f64>() / 9.0;
        let stddev = (prior.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 8.0).sqrt();

        let flagged: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                ScoreOutcome::Anomalous(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].observed_value, 50.0);
        assert!((flagged[0].z_score - (50.0 - mean) / stddev).abs() < 1e-9);
    }

    #[test]
    fn test_never_flags_without_stddev() {
        let scorer = scorer(AnomalyScorerConfig::default());
        let outcomes = run(&scorer, &[1.0, 1_000.0]);
        assert_eq!(outcomes[0], ScoreOutcome::InsufficientStatistics);
        assert_eq!(outcomes[1], ScoreOutcome::InsufficientStatistics);
    }

    #[test]
    fn test_min_samples() {
        let scorer = scorer(AnomalyScorerConfig {
            min_samples: 5,
            ..Default::default()
        });
        let outcomes = run(&scorer, &[10.0, 10.0, 10.0, 100.0]);
        assert_eq!(outcomes[3], ScoreOutcome::InsufficientStatistics);
    }

    #[test]
    fn test_threshold_override() {
        let mut overrides = HashMap::new();
        overrides.insert("A".to_string(), 10.0);
        let scorer = scorer(AnomalyScorerConfig {
            threshold_overrides: overrides,
            ..Default::default()
        });
        assert_eq!(scorer.threshold_for("A"), 10.0);
        assert_eq!(scorer.threshold_for("B"), 3.0);

        // z is about 4.3 for the last value: flagged at 3.0, not at 10.0
        let outcomes = run(&scorer, &[9.0, 11.0, 9.0, 11.0, 15.0]);
        assert!(matches!(outcomes[4], ScoreOutcome::Normal { .. }));
    }

    #[test]
    fn test_equal_value_on_flat_baseline_is_normal() {
        let scorer = scorer(AnomalyScorerConfig::default());
        let outcomes = run(&scorer, &[5.0, 5.0, 5.0]);
        assert_eq!(outcomes[2], ScoreOutcome::Normal { z_score: 0.0 });
    }

    #[test]
    fn test_score_returns_only_anomalies() {
        let scorer = scorer(AnomalyScorerConfig::default());
        let mut stats = baseline();
        for v in [10.0, 12.0, 11.0] {
            stats.update(v);
        }

        assert!(scorer.score(&sale(3, 11.0), &stats).is_none());
        let record = scorer.score(&sale(4, 90.0), &stats).expect("spike is flagged");
        assert_eq!(record.observed_value, 90.0);
        assert_eq!(record.mean_at_time, 11.0);
        assert_eq!(record.window_ref, stats.window_ref);

        // Too few samples never yields a record
        assert!(scorer.score(&sale(5, 90.0), &baseline()).is_none());
    }

    #[test]
    fn test_record_key_distinguishes_unoffset_events() {
        let scorer = scorer(AnomalyScorerConfig::default());
        let mut stats = baseline();
        for v in [5.0, 5.0, 5.0] {
            stats.update(v);
        }
        let at = |minute: i64| {
            Event::sale(
                Utc.timestamp_millis_opt(minute * 60_000).unwrap(),
                "A",
                50.0,
                1.0,
                "s1",
            )
        };

        let first = scorer.score(&at(3), &stats).unwrap();
        let second = scorer.score(&at(4), &stats).unwrap();
        assert_eq!(first.offset, second.offset);
        assert_eq!(first.record_key(), "A/180000/0/0");
        assert_ne!(first.record_key(), second.record_key());
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(Severity::from_z_score(3.5), Severity::Warning);
        assert_eq!(Severity::from_z_score(-4.5), Severity::Error);
        assert_eq!(Severity::from_z_score(6.0), Severity::Critical);
    }
}
