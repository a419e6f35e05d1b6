//! Time windows
//!
//! - [`WindowBounds`]: half-open `[start, end)` interval
//! - [`WindowRef`]: identifies one window of one family for one partition key
//! - [`WindowState`]: OPEN → CLOSING → CLOSED lifecycle derived from the watermark
//! - [`WindowAssigner`]: maps an event time onto the windows that contain it
//! - [`WindowManager`]: per-partition window storage, admission and closing

pub mod assigner;
pub mod manager;

pub use assigner::{SlidingWindowAssigner, TumblingWindowAssigner, WindowAssigner, WindowType};
pub use manager::{ClosedWindow, ManagerStats, Window, WindowAccumulator, WindowManager};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Bounds from epoch milliseconds
    pub fn from_millis(start: i64, end: i64) -> Option<Self> {
        Some(Self {
            start: Utc.timestamp_millis_opt(start).single()?,
            end: Utc.timestamp_millis_opt(end).single()?,
        })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn start_millis(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_millis(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Which aggregate a window maintains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFamily {
    /// Per-SKU quantity totals feeding the forecaster
    Forecast,
    /// Per-SKU quantity baselines for anomaly scoring
    AnomalyStats,
    /// Stream-wide mention batches for sentiment counts
    Sentiment,
}

impl WindowFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowFamily::Forecast => "forecast",
            WindowFamily::AnomalyStats => "anomaly_stats",
            WindowFamily::Sentiment => "sentiment",
        }
    }
}

impl fmt::Display for WindowFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one window instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowRef {
    pub family: WindowFamily,
    pub partition_key: String,
    pub bounds: WindowBounds,
}

impl WindowRef {
    pub fn new(family: WindowFamily, partition_key: impl Into<String>, bounds: WindowBounds) -> Self {
        Self {
            family,
            partition_key: partition_key.into(),
            bounds,
        }
    }
}

impl fmt::Display for WindowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}-{}",
            self.family,
            self.partition_key,
            self.bounds.start_millis(),
            self.bounds.end_millis()
        )
    }
}

/// Window lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowState {
    /// Watermark has not reached the window end
    Open,
    /// End passed, late events still admitted
    Closing,
    /// Lateness tolerance expired; immutable
    Closed,
}

impl WindowState {
    /// State of `bounds` at `watermark` (epoch millis)
    ///
    /// OPEN while `watermark < end`, CLOSING while
    /// `end <= watermark <= end + lateness`, CLOSED after that.
    pub fn at(bounds: &WindowBounds, lateness: Duration, watermark: Option<i64>) -> Self {
        let Some(watermark) = watermark else {
            return WindowState::Open;
        };
        let end = bounds.end_millis();
        let deadline = end.saturating_add(lateness.num_milliseconds());
        if watermark < end {
            WindowState::Open
        } else if watermark <= deadline {
            WindowState::Closing
        } else {
            WindowState::Closed
        }
    }

    /// Transitions are forward-only
    pub fn can_transition_to(&self, to: WindowState) -> bool {
        use WindowState::*;
        matches!(
            (self, to),
            (Open, Closing) | (Open, Closed) | (Closing, Closed)
        )
    }

    pub fn accepts_events(&self) -> bool {
        !matches!(self, WindowState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowState::Open => "OPEN",
            WindowState::Closing => "CLOSING",
            WindowState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
