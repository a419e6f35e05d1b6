//! Window assigners
//!
//! Window starts are aligned to the epoch, so the same event time always maps
//! to the same windows regardless of arrival order.

use super::WindowBounds;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Shape of the windows an assigner produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Tumbling,
    Sliding,
}

impl WindowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::Tumbling => "tumbling",
            WindowType::Sliding => "sliding",
        }
    }
}

/// Maps an event time onto the windows containing it
pub trait WindowAssigner: Send + Sync + Debug {
    /// Windows containing `timestamp`, ordered by start
    fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<WindowBounds>;

    fn window_type(&self) -> WindowType;

    fn size(&self) -> Duration;
}

/// Non-overlapping fixed-size windows
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    size_ms: i64,
}

impl TumblingWindowAssigner {
    pub fn new(size: Duration) -> Self {
        Self {
            size_ms: size.num_milliseconds().max(1),
        }
    }
}

impl WindowAssigner for TumblingWindowAssigner {
    fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<WindowBounds> {
        let ts = timestamp.timestamp_millis();
        let start = ts - ts.rem_euclid(self.size_ms);
        WindowBounds::from_millis(start, start + self.size_ms)
            .into_iter()
            .collect()
    }

    fn window_type(&self) -> WindowType {
        WindowType::Tumbling
    }

    fn size(&self) -> Duration {
        Duration::milliseconds(self.size_ms)
    }
}

/// Overlapping fixed-size windows starting every `slide`
#[derive(Debug, Clone)]
pub struct SlidingWindowAssigner {
    size_ms: i64,
    slide_ms: i64,
}

impl SlidingWindowAssigner {
    /// `slide` is clamped to `(0, size]`
    pub fn new(size: Duration, slide: Duration) -> Self {
        let size_ms = size.num_milliseconds().max(1);
        let slide_ms = slide.num_milliseconds().clamp(1, size_ms);
        Self { size_ms, slide_ms }
    }

    pub fn slide(&self) -> Duration {
        Duration::milliseconds(self.slide_ms)
    }
}

impl WindowAssigner for SlidingWindowAssigner {
    fn assign_windows(&self, timestamp: DateTime<Utc>) -> Vec<WindowBounds> {
        let ts = timestamp.timestamp_millis();
        let last_start = ts - ts.rem_euclid(self.slide_ms);

        let mut windows = Vec::with_capacity((self.size_ms / self.slide_ms) as usize + 1);
        let mut start = last_start;
        while start > ts - self.size_ms {
            if let Some(bounds) = WindowBounds::from_millis(start, start + self.size_ms) {
                windows.push(bounds);
            }
            start -= self.slide_ms;
        }
        windows.reverse();
        windows
    }

    fn window_type(&self) -> WindowType {
        WindowType::Sliding
    }

    fn size(&self) -> Duration {
        Duration::milliseconds(self.size_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn test_tumbling_assignment() {
        let assigner = TumblingWindowAssigner::new(Duration::milliseconds(1_000));

        let windows = assigner.assign_windows(ts(1_500));
        assert_eq!(windows, vec![WindowBounds::from_millis(1_000, 2_000).unwrap()]);

        let windows = assigner.assign_windows(ts(2_000));
        assert_eq!(windows[0].start, ts(2_000));
        assert_eq!(assigner.window_type(), WindowType::Tumbling);
    }

    #[test]
    fn test_tumbling_before_epoch() {
        let assigner = TumblingWindowAssigner::new(Duration::milliseconds(1_000));
        let windows = assigner.assign_windows(ts(-1));
        assert_eq!(windows, vec![WindowBounds::from_millis(-1_000, 0).unwrap()]);
    }

    #[test]
    fn test_sliding_assignment() {
        let assigner =
            SlidingWindowAssigner::new(Duration::milliseconds(1_000), Duration::milliseconds(500));

        let windows = assigner.assign_windows(ts(700));
        assert_eq!(
            windows,
            vec![
                WindowBounds::from_millis(0, 1_000).unwrap(),
                WindowBounds::from_millis(500, 1_500).unwrap(),
            ]
        );
        assert!(windows.iter().all(|w| w.contains(ts(700))));
    }

    #[test]
    fn test_sliding_with_equal_slide_is_tumbling() {
        let assigner =
            SlidingWindowAssigner::new(Duration::milliseconds(1_000), Duration::milliseconds(1_000));
        assert_eq!(assigner.assign_windows(ts(1_234)).len(), 1);
    }
}
