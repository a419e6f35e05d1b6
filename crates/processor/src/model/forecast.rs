//! Pluggable demand forecasting
//!
//! A forecaster receives the time-binned quantity series of one partition key
//! (oldest first) and predicts the value of the next bin.

use crate::error::DownstreamError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One time bin of a forecast input series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Bin start
    pub timestamp: DateTime<Utc>,
    /// Aggregated quantity in the bin
    pub value: f64,
}

/// Forecast function: ordered series in, next value out
#[async_trait]
pub trait Forecaster: Send + Sync {
    /// Predict the next value of `series` for `partition_key`
    async fn forecast(&self, partition_key: &str, series: &[SeriesPoint]) -> Result<f64, DownstreamError>;

    fn name(&self) -> &str {
        "forecaster"
    }
}

/// Holt linear-trend exponential smoothing
///
/// Level and trend are smoothed with `alpha` and `beta`; the forecast is
/// `level + trend`, floored at zero since demand cannot be negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialSmoothingForecaster {
    alpha: f64,
    beta: f64,
}

impl ExponentialSmoothingForecaster {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            beta: beta.clamp(0.0, 1.0),
        }
    }

    fn smooth(&self, values: &[f64]) -> Option<f64> {
        let (&first, rest) = values.split_first()?;
        let mut level = first;
        let mut trend = rest.first().map_or(0.0, |second| second - first);

        for &value in rest {
            let last_level = level;
            level = self.alpha * value + (1.0 - self.alpha) * (last_level + trend);
            trend = self.beta * (level - last_level) + (1.0 - self.beta) * trend;
        }

        Some((level + trend).max(0.0))
    }
}

impl Default for ExponentialSmoothingForecaster {
    fn default() -> Self {
        Self::new(0.5, 0.3)
    }
}

#[async_trait]
impl Forecaster for ExponentialSmoothingForecaster {
    async fn forecast(&self, partition_key: &str, series: &[SeriesPoint]) -> Result<f64, DownstreamError> {
        let values: Vec<f64> = series.iter().map(|p| p.value).collect();
        let prediction = self
            .smooth(&values)
            .ok_or_else(|| DownstreamError::EmptySeries(partition_key.to_string()))?;
        if !prediction.is_finite() {
            return Err(DownstreamError::failed(
                self.name(),
                format!("non-finite forecast for '{partition_key}'"),
            ));
        }
        Ok(prediction)
    }

    fn name(&self) -> &str {
        "exponential_smoothing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn series(values: &[f64]) -> Vec<SeriesPoint> {
        let start = Utc.timestamp_millis_opt(0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| SeriesPoint {
                timestamp: start + Duration::hours(i as i64),
                value: *v,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_constant_series() {
        let forecaster = ExponentialSmoothingForecaster::default();
        let prediction = forecaster.forecast("A", &series(&[7.0, 7.0, 7.0])).await.unwrap();
        assert!((prediction - 7.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_linear_trend_is_extrapolated() {
        let forecaster = ExponentialSmoothingForecaster::default();
        let prediction = forecaster
            .forecast("A", &series(&[1.0, 2.0, 3.0, 4.0]))
            .await
            .unwrap();
        assert!((prediction - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_single_point_and_floor() {
        let forecaster = ExponentialSmoothingForecaster::default();
        assert_eq!(forecaster.forecast("A", &series(&[3.0])).await.unwrap(), 3.0);

        let falling = forecaster.forecast("A", &series(&[10.0, 0.0])).await.unwrap();
        assert_eq!(falling, 0.0);
    }

    #[tokio::test]
    async fn test_empty_series_fails() {
        let forecaster = ExponentialSmoothingForecaster::default();
        assert_eq!(
            forecaster.forecast("A", &[]).await,
            Err(DownstreamError::EmptySeries("A".to_string()))
        );
    }
}
