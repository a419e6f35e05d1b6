//! Output records and the logical tables they belong to

use crate::aggregation::AggregateStats;
use crate::analyzer::AnomalyRecord;
use crate::model::SentimentLabel;
use crate::window::WindowRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical output table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTable {
    Forecast,
    Anomaly,
    Sentiment,
    WindowStats,
}

impl OutputTable {
    pub const ALL: [OutputTable; 4] = [
        OutputTable::Forecast,
        OutputTable::Anomaly,
        OutputTable::Sentiment,
        OutputTable::WindowStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputTable::Forecast => "forecast_table",
            OutputTable::Anomaly => "anomalies_table",
            OutputTable::Sentiment => "sentiments_table",
            OutputTable::WindowStats => "window_stats_table",
        }
    }
}

impl fmt::Display for OutputTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forecast for the next bin of one partition key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    /// Start of the bin being forecast
    pub timestamp: DateTime<Utc>,
    pub partition_key: String,
    /// Quantity of the latest bin in the input series
    pub observed_qty: f64,
    pub forecast_qty: f64,
    /// Number of bins the forecast was computed from
    pub history_len: usize,
}

/// Count of one label in one sentiment window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentCount {
    pub window_end: DateTime<Utc>,
    pub label: SentimentLabel,
    pub count: u64,
}

/// Final statistics of a closed window, with the derived moments spelled out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatsRecord {
    pub window_ref: WindowRef,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    /// `None` while the window is empty
    pub mean: Option<f64>,
    /// Sample variance and standard deviation, `None` below two values
    pub variance: Option<f64>,
    pub stddev: Option<f64>,
}

impl From<&AggregateStats> for WindowStatsRecord {
    fn from(stats: &AggregateStats) -> Self {
        Self {
            window_ref: stats.window_ref.clone(),
            window_start: stats.window_ref.bounds.start,
            window_end: stats.window_ref.bounds.end,
            count: stats.count,
            sum: stats.sum,
            sum_sq: stats.sum_sq,
            mean: stats.mean(),
            variance: stats.variance(),
            stddev: stats.stddev(),
        }
    }
}

/// Any record the publisher can write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    Forecast(ForecastRecord),
    Anomaly(AnomalyRecord),
    Sentiment(SentimentCount),
    WindowStats(WindowStatsRecord),
}

impl OutputRecord {
    pub fn table(&self) -> OutputTable {
        match self {
            OutputRecord::Forecast(_) => OutputTable::Forecast,
            OutputRecord::Anomaly(_) => OutputTable::Anomaly,
            OutputRecord::Sentiment(_) => OutputTable::Sentiment,
            OutputRecord::WindowStats(_) => OutputTable::WindowStats,
        }
    }

    /// Upsert key; re-publishing a record with the same key overwrites it
    pub fn record_key(&self) -> String {
        match self {
            OutputRecord::Forecast(r) => {
                format!("{}/{}", r.partition_key, r.timestamp.timestamp_millis())
            }
            OutputRecord::Anomaly(r) => r.record_key(),
            OutputRecord::Sentiment(r) => {
                format!("{}/{}", r.window_end.timestamp_millis(), r.label)
            }
            OutputRecord::WindowStats(s) => s.window_ref.to_string(),
        }
    }
}
