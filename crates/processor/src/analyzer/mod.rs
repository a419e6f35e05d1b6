//! Anomaly analysis over live window statistics

pub mod anomaly_scorer;

pub use anomaly_scorer::{AnomalyRecord, AnomalyScorer, AnomalyScorerConfig, ScoreOutcome, Severity};
