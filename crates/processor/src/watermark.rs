//! Event-time watermark
//!
//! A watermark is the processor's notion of "now" for one input stream. In
//! event-time mode it is the largest event time the stream has shown; in
//! processing-time mode the scheduler moves it to the wall clock. It never
//! moves backwards.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::trace;

const UNSET: i64 = i64::MIN;

/// Clock that drives watermarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDomain {
    /// Watermark follows the maximum observed event time
    #[default]
    EventTime,
    /// Watermark follows the wall clock
    ProcessingTime,
}

/// Monotonic watermark shared by the window managers of one stream
#[derive(Debug)]
pub struct Watermark {
    name: &'static str,
    millis: AtomicI64,
}

impl Watermark {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            millis: AtomicI64::new(UNSET),
        }
    }

    /// Advance to `to` if it is later than the current value
    ///
    /// Returns true when the watermark moved.
    pub fn advance(&self, to: DateTime<Utc>) -> bool {
        let target = to.timestamp_millis();
        let previous = self.millis.fetch_max(target, Ordering::AcqRel);
        let moved = target > previous;
        if moved {
            trace!(stream = self.name, watermark = %to, "Advanced watermark");
        }
        moved
    }

    pub fn current_millis(&self) -> Option<i64> {
        match self.millis.load(Ordering::Acquire) {
            UNSET => None,
            millis => Some(millis),
        }
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.current_millis()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
