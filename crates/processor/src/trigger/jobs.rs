//! Downstream invocations run by the trigger controller

use super::controller::TriggerJob;
use super::state::{TriggerKey, TriggerKind};
use crate::aggregation::AggregateStats;
use crate::error::TriggerError;
use crate::metrics::PipelineMetrics;
use crate::model::{Forecaster, SentimentClassifier, SentimentLabel, SeriesPoint};
use crate::publisher::{ForecastRecord, OutputPublisher, OutputRecord, SentimentCount};
use crate::window::{WindowManager, WindowRef};
use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ordered quantity series of a partition key
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Bins oldest first; `include_live` appends windows that are still open
    async fn series(&self, partition_key: &str, include_live: bool) -> Vec<SeriesPoint>;
}

#[async_trait]
impl SeriesSource for WindowManager<AggregateStats> {
    async fn series(&self, partition_key: &str, include_live: bool) -> Vec<SeriesPoint> {
        let mut points: Vec<SeriesPoint> = self
            .history(partition_key)
            .await
            .into_iter()
            .map(|closed| SeriesPoint {
                timestamp: closed.window_ref.bounds.start,
                value: closed.accumulator.sum,
            })
            .collect();

        if include_live {
            points.extend(self.live_windows(partition_key).await.into_iter().map(|window| {
                SeriesPoint {
                    timestamp: window.window_ref.bounds.start,
                    value: window.accumulator.sum,
                }
            }));
        }
        points
    }
}

/// Texts of one closed sentiment window awaiting classification
#[derive(Debug, Clone, PartialEq)]
pub struct MentionBatch {
    pub window_ref: WindowRef,
    pub texts: Vec<String>,
}

/// Runs the forecast and sentiment computations and publishes their output
pub struct DownstreamJobs {
    forecaster: Arc<dyn Forecaster>,
    classifier: Arc<dyn SentimentClassifier>,
    series: Arc<dyn SeriesSource>,
    publisher: Arc<OutputPublisher>,
    /// Closed sentiment windows per partition key, oldest first
    mention_batches: DashMap<String, VecDeque<MentionBatch>>,
    forecast_step: Duration,
    include_live: bool,
    metrics: Arc<PipelineMetrics>,
}

impl DownstreamJobs {
    pub fn new(
        forecaster: Arc<dyn Forecaster>,
        classifier: Arc<dyn SentimentClassifier>,
        series: Arc<dyn SeriesSource>,
        publisher: Arc<OutputPublisher>,
        forecast_step: Duration,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            forecaster,
            classifier,
            series,
            publisher,
            mention_batches: DashMap::new(),
            forecast_step,
            include_live: false,
            metrics,
        }
    }

    /// Also feed the live forecast window to the forecaster
    pub fn with_live_series(mut self, include_live: bool) -> Self {
        self.include_live = include_live;
        self
    }

    /// Queue a closed sentiment window for its key's next invocation
    pub fn enqueue_mentions(&self, batch: MentionBatch) -> TriggerKey {
        let key = TriggerKey::sentiment(batch.window_ref.partition_key.clone());
        self.mention_batches
            .entry(key.partition_key.clone())
            .or_default()
            .push_back(batch);
        key
    }

    /// Batches waiting for classification
    pub fn queued_batches(&self) -> usize {
        self.mention_batches.iter().map(|queue| queue.len()).sum()
    }

    async fn run_forecast(&self, partition_key: &str) -> Result<(), TriggerError> {
        let series = self.series.series(partition_key, self.include_live).await;
        let Some(last) = series.last().copied() else {
            debug!(partition_key, "No closed windows yet, nothing to forecast");
            return Ok(());
        };

        let forecast_qty = self.forecaster.forecast(partition_key, &series).await?;
        let record = ForecastRecord {
            timestamp: last.timestamp + self.forecast_step,
            partition_key: partition_key.to_string(),
            observed_qty: last.value,
            forecast_qty,
            history_len: series.len(),
        };
        debug!(
            partition_key,
            forecaster = self.forecaster.name(),
            history_len = record.history_len,
            forecast_qty,
            "Forecast computed"
        );
        self.publisher.publish(&OutputRecord::Forecast(record)).await?;
        Ok(())
    }

    async fn run_sentiment(
        &self,
        partition_key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), TriggerError> {
        while let Some(batch) = self.pop_batch(partition_key) {
            match self.classify_batch(&batch, cancel).await {
                Ok(counts) => {
                    if let Err(e) = self.publish_counts(&batch, counts).await {
                        self.requeue_batch(batch);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.requeue_batch(batch);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn classify_batch(
        &self,
        batch: &MentionBatch,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<SentimentLabel, u64>, TriggerError> {
        let mut counts = BTreeMap::new();
        for text in &batch.texts {
            if cancel.is_cancelled() {
                debug!(window = %batch.window_ref, "Sentiment batch cancelled, discarding partial counts");
                return Err(TriggerError::Cancelled);
            }
            match self.classifier.classify(text).await {
                Ok(label) => *counts.entry(label).or_insert(0) += 1,
                Err(e) => {
                    self.metrics.record_sentiment_text_skipped();
                    warn!(
                        window = %batch.window_ref,
                        classifier = self.classifier.name(),
                        error = %e,
                        "Skipping mention the classifier failed on"
                    );
                }
            }
        }
        Ok(counts)
    }

    async fn publish_counts(
        &self,
        batch: &MentionBatch,
        counts: BTreeMap<SentimentLabel, u64>,
    ) -> Result<(), TriggerError> {
        for (label, count) in counts {
            let record = SentimentCount {
                window_end: batch.window_ref.bounds.end,
                label,
                count,
            };
            self.publisher.publish(&OutputRecord::Sentiment(record)).await?;
        }
        debug!(window = %batch.window_ref, texts = batch.texts.len(), "Sentiment batch published");
        Ok(())
    }

    fn pop_batch(&self, partition_key: &str) -> Option<MentionBatch> {
        self.mention_batches.get_mut(partition_key)?.pop_front()
    }

    fn requeue_batch(&self, batch: MentionBatch) {
        self.mention_batches
            .entry(batch.window_ref.partition_key.clone())
            .or_default()
            .push_front(batch);
    }
}

#[async_trait]
impl TriggerJob for DownstreamJobs {
    async fn run(&self, key: &TriggerKey, cancel: &CancellationToken) -> Result<(), TriggerError> {
        match key.kind {
            TriggerKind::Forecast => self.run_forecast(&key.partition_key).await,
            TriggerKind::Sentiment => self.run_sentiment(&key.partition_key, cancel).await,
        }
    }
}
