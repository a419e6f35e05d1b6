//! Running sufficient statistics
//!
//! Mean and variance are maintained with Welford's online update, which
//! stays numerically stable where the naive `sum_sq - sum^2 / n` formula
//! cancels catastrophically. `sum` and `sum_sq` are kept alongside for
//! consumers that want raw totals.

use crate::error::AggregationError;
use crate::window::{WindowAccumulator, WindowManager, WindowRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Statistics of one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub window_ref: WindowRef,
    pub count: u64,
    pub sum: f64,
    pub sum_sq: f64,
    /// Running mean, 0.0 while empty
    pub mean: f64,
    /// Sum of squared deviations from the mean
    pub m2: f64,
}

impl AggregateStats {
    pub fn new(window_ref: WindowRef) -> Self {
        Self {
            window_ref,
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Fold one value in
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    /// Mean, undefined while empty
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Sample variance (n - 1), undefined below two values
    pub fn variance(&self) -> Option<f64> {
        (self.count >= 2).then(|| self.m2 / (self.count - 1) as f64)
    }

    /// Sample standard deviation, undefined below two values
    pub fn stddev(&self) -> Option<f64> {
        self.variance().map(|v| v.max(0.0).sqrt())
    }
}

impl WindowAccumulator for AggregateStats {
    fn create(window_ref: &WindowRef) -> Self {
        AggregateStats::new(window_ref.clone())
    }
}

/// Applies values to the statistics owned by a window manager
#[derive(Clone)]
pub struct IncrementalAggregator {
    windows: Arc<WindowManager<AggregateStats>>,
}

impl IncrementalAggregator {
    pub fn new(windows: Arc<WindowManager<AggregateStats>>) -> Self {
        Self { windows }
    }

    /// Fold `value` into the live window `window_ref` and return the new stats
    ///
    /// Fails if the window is closed or unknown, or the value is not finite.
    pub async fn update(
        &self,
        window_ref: &WindowRef,
        value: f64,
    ) -> Result<AggregateStats, AggregationError> {
        if !value.is_finite() {
            return Err(AggregationError::NonFiniteValue(value));
        }
        self.windows
            .update_window(window_ref, |stats| {
                stats.update(value);
                stats.clone()
            })
            .await
            .map_err(AggregationError::from)
    }

    /// In-place update used while the caller already holds the window
    pub fn accumulate(
        stats: &mut AggregateStats,
        value: f64,
    ) -> Result<AggregateStats, AggregationError> {
        if !value.is_finite() {
            return Err(AggregationError::NonFiniteValue(value));
        }
        stats.update(value);
        trace!(
            window = %stats.window_ref,
            count = stats.count,
            mean = stats.mean,
            "Updated aggregate"
        );
        Ok(stats.clone())
    }

    pub fn windows(&self) -> &Arc<WindowManager<AggregateStats>> {
        &self.windows
    }
}
