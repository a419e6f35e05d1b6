//! Stream processor wiring every component together
//!
//! `StreamProcessor` is the explicit context object of one pipeline run. It
//! owns the window managers, the anomaly scorer, the trigger controller and
//! the output publisher, and coordinates:
//! - Event normalization and admission per stream
//! - Incremental aggregation and pre-update anomaly scoring
//! - Window closing on the scheduler cadence or on flush
//! - Trigger requests for forecast and sentiment computations
//! - Publishing of buffered outputs
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ sales feed   │   │ mentions feed│
//! └──────┬───────┘   └──────┬───────┘
//!        ▼                  ▼
//! ┌─────────────────────────────────┐
//! │      EventSourceAdapter         │
//! └──────┬──────────────────┬───────┘
//!        ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ forecast +   │   │ sentiment    │ ◄─── WindowManager per family
//! │ anomaly_stats│   │ windows      │
//! └──────┬───────┘   └──────┬───────┘
//!        ▼                  │
//! ┌──────────────┐          │
//! │AnomalyScorer │          │
//! └──────┬───────┘          ▼
//!        │          ┌──────────────────┐
//!        │          │TriggerController │ ◄─── forecast / classify
//!        ▼          └────────┬─────────┘
//! ┌─────────────────────────────────┐
//! │        OutputPublisher          │
//! └─────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use processor::{Event, ProcessorConfig, StreamProcessorBuilder};
//! use chrono::Utc;
//!
//! # async fn example() -> processor::Result<()> {
//! let processor = StreamProcessorBuilder::new(ProcessorConfig::default()).build()?;
//! processor.start().await?;
//!
//! processor
//!     .process_event(Event::sale(Utc::now(), "A", 5.0, 9.99, "store-1"))
//!     .await?;
//!
//! processor.flush().await?;
//! processor.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::aggregation::{AggregateStats, IncrementalAggregator, MentionBuffer, ALL_MENTIONS};
use crate::analyzer::{AnomalyRecord, AnomalyScorer, AnomalyScorerConfig, ScoreOutcome};
use crate::config::{ProcessorConfig, TriggerPolicy};
use crate::core::{Event, EventPayload, StreamKind};
use crate::error::{AggregationError, MalformedRecordError, ProcessorError, SinkWriteError, WindowError};
use crate::metrics::{MetricsRegistry, MetricsSnapshot, PipelineMetrics};
use crate::model::{
    ExponentialSmoothingForecaster, Forecaster, KeywordSentimentClassifier, SentimentClassifier,
};
use crate::publisher::{InMemorySink, OutputPublisher, OutputRecord, Sink, WindowStatsRecord};
use crate::source::{EventSourceAdapter, RawRecord};
use crate::trigger::{
    CadenceTask, DownstreamJobs, MentionBatch, Scheduler, SeriesSource, TriggerController,
    TriggerControllerConfig, TriggerCounts, TriggerJob, TriggerKey,
};
use crate::watermark::{TimeDomain, Watermark};
use crate::window::{
    ClosedWindow, ManagerStats, SlidingWindowAssigner, TumblingWindowAssigner, WindowAssigner,
    WindowFamily, WindowManager, WindowRef,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Lifecycle of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Initialized,
    Running,
    Draining,
    Stopped,
}

impl ProcessorState {
    pub fn can_transition_to(&self, to: ProcessorState) -> bool {
        matches!(
            (self, to),
            (ProcessorState::Initialized, ProcessorState::Running)
                | (ProcessorState::Initialized, ProcessorState::Draining)
                | (ProcessorState::Running, ProcessorState::Draining)
                | (ProcessorState::Draining, ProcessorState::Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorState::Initialized => "initialized",
            ProcessorState::Running => "running",
            ProcessorState::Draining => "draining",
            ProcessorState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-scoped state shared by every component of one run
pub struct ProcessorContext {
    pub run_id: Uuid,
    pub config: ProcessorConfig,
    pub metrics: MetricsRegistry,
}

impl ProcessorContext {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config,
            metrics: MetricsRegistry::new(),
        }
    }
}

/// Result of processing one event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventOutcome {
    /// Windows that admitted the event
    pub windows: Vec<WindowRef>,
    /// Anomalies flagged for the event, one per baseline window
    pub anomalies: Vec<AnomalyRecord>,
}

/// What one cadence tick or flush did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub windows_closed: usize,
    pub records_published: usize,
    pub triggers_dispatched: usize,
}

/// Point-in-time view of a processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub run_id: Uuid,
    pub state: ProcessorState,
    pub windows: Vec<ManagerStats>,
    pub pending_outputs: usize,
    pub queued_mention_batches: usize,
    pub triggers: TriggerCounts,
    pub metrics: MetricsSnapshot,
}

/// Streaming windowed aggregation and anomaly detection engine
pub struct StreamProcessor {
    context: ProcessorContext,
    state: RwLock<ProcessorState>,
    adapter: EventSourceAdapter,
    sales_watermark: Arc<Watermark>,
    mentions_watermark: Arc<Watermark>,
    forecast_windows: Arc<WindowManager<AggregateStats>>,
    anomaly_windows: Arc<WindowManager<AggregateStats>>,
    sentiment_windows: Arc<WindowManager<MentionBuffer>>,
    scorer: AnomalyScorer,
    jobs: Arc<DownstreamJobs>,
    controller: Arc<TriggerController>,
    publisher: Arc<OutputPublisher>,
    /// Records produced on the ingestion path, written by the next tick
    pending_outputs: Mutex<Vec<OutputRecord>>,
    scheduler_cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<Result<u64, ProcessorError>>>>,
    metrics: Arc<PipelineMetrics>,
}

impl StreamProcessor {
    pub fn context(&self) -> &ProcessorContext {
        &self.context
    }

    pub fn run_id(&self) -> Uuid {
        self.context.run_id
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.context.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Prometheus text exposition of this processor's metrics
    pub fn encode_metrics(&self) -> Result<String, fmt::Error> {
        self.context.metrics.encode()
    }

    pub fn publisher(&self) -> &Arc<OutputPublisher> {
        &self.publisher
    }

    pub fn controller(&self) -> &Arc<TriggerController> {
        &self.controller
    }

    pub fn forecast_windows(&self) -> &Arc<WindowManager<AggregateStats>> {
        &self.forecast_windows
    }

    pub fn anomaly_windows(&self) -> &Arc<WindowManager<AggregateStats>> {
        &self.anomaly_windows
    }

    pub fn sentiment_windows(&self) -> &Arc<WindowManager<MentionBuffer>> {
        &self.sentiment_windows
    }

    pub fn watermark(&self, stream: StreamKind) -> &Arc<Watermark> {
        match stream {
            StreamKind::Sales => &self.sales_watermark,
            StreamKind::Mentions => &self.mentions_watermark,
        }
    }

    pub async fn state(&self) -> ProcessorState {
        *self.state.read().await
    }

    async fn transition(&self, to: ProcessorState) -> Result<(), ProcessorError> {
        let mut state = self.state.write().await;
        if !state.can_transition_to(to) {
            return Err(ProcessorError::InvalidState {
                from: state.to_string(),
                to: to.to_string(),
            });
        }
        debug!(run_id = %self.context.run_id, from = state.as_str(), to = to.as_str(), "Processor state changed");
        *state = to;
        Ok(())
    }

    /// Normalize and process one raw record
    ///
    /// Never fails: malformed records, late events and aggregation errors
    /// are counted, logged and skipped. Returns the outcome for accepted
    /// events.
    pub async fn ingest_raw(&self, raw: RawRecord) -> Option<EventOutcome> {
        self.metrics.record_event_received(raw.stream);

        let event = match self.adapter.normalize(&raw) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_malformed(raw.stream);
                warn!(stream = %raw.stream, offset = ?raw.offset, error = %e, "Skipping malformed record");
                return None;
            }
        };

        match self.process_event(event).await {
            Ok(outcome) => Some(outcome),
            // Counted and logged by the window manager
            Err(ProcessorError::Window(WindowError::LateDropped { .. })) => None,
            Err(e) => {
                warn!(stream = %raw.stream, error = %e, "Skipping event");
                None
            }
        }
    }

    /// Admit an event into its windows, updating statistics and scoring sales
    ///
    /// Fails with a late-drop error only when no window of the event's
    /// stream accepted it.
    pub async fn process_event(&self, event: Event) -> Result<EventOutcome, ProcessorError> {
        let started = Instant::now();
        let stream = event.stream();

        if *self.state.read().await == ProcessorState::Stopped {
            return Err(ProcessorError::InvalidState {
                from: ProcessorState::Stopped.to_string(),
                to: "processing".to_string(),
            });
        }

        if self.context.config.time_domain == TimeDomain::EventTime {
            let watermark = self.watermark(stream);
            if watermark.advance(event.event_time) {
                self.metrics
                    .set_watermark(watermark.name(), event.event_time.timestamp_millis());
            }
        }

        let result = match &event.payload {
            EventPayload::Sale(sale) => self.process_sale(&event, sale.quantity).await,
            EventPayload::Mention(mention) => self.process_mention(&event, &mention.text).await,
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, ProcessorError::Window(WindowError::LateDropped { .. })) {
                    self.metrics.record_event_late_dropped(stream);
                }
                return Err(e);
            }
        };

        self.metrics.record_event_accepted(stream);
        self.metrics
            .record_event_processing_duration(stream, started.elapsed().as_secs_f64());
        trace!(
            stream = %stream,
            partition_key = %event.partition_key,
            offset = event.offset,
            windows = outcome.windows.len(),
            "Processed event"
        );
        Ok(outcome)
    }

    async fn process_sale(&self, event: &Event, quantity: f64) -> Result<EventOutcome, ProcessorError> {
        if !quantity.is_finite() {
            return Err(AggregationError::NonFiniteValue(quantity).into());
        }
        let key = event.partition_key.as_str();
        let mut outcome = EventOutcome::default();
        let mut late = None;

        match self
            .forecast_windows
            .apply(key, event.event_time, |_, stats| {
                IncrementalAggregator::accumulate(stats, quantity)
            })
            .await
        {
            Ok(updated) => {
                for stats in updated {
                    outcome.windows.push(stats?.window_ref);
                }
                if self.context.config.trigger_policy == TriggerPolicy::Cadence {
                    self.controller.request(&TriggerKey::forecast(key));
                }
            }
            Err(e) => late = Some(e),
        }

        // Score against the statistics as they were before this event
        match self
            .anomaly_windows
            .apply(key, event.event_time, |_, stats| {
                let score = self.scorer.evaluate(event, stats);
                (score, IncrementalAggregator::accumulate(stats, quantity))
            })
            .await
        {
            Ok(updated) => {
                for (score, stats) in updated {
                    outcome.windows.push(stats?.window_ref);
                    if let ScoreOutcome::Anomalous(record) = score {
                        outcome.anomalies.push(record);
                    }
                }
            }
            Err(e) => late = late.or(Some(e)),
        }

        if outcome.windows.is_empty() {
            if let Some(e) = late {
                return Err(e.into());
            }
        }

        if !outcome.anomalies.is_empty() {
            let mut pending = self.pending_outputs.lock().await;
            pending.extend(outcome.anomalies.iter().cloned().map(OutputRecord::Anomaly));
        }
        Ok(outcome)
    }

    async fn process_mention(&self, event: &Event, text: &str) -> Result<EventOutcome, ProcessorError> {
        if text.trim().is_empty() {
            return Err(MalformedRecordError::MissingField { field: "text" }.into());
        }
        let windows = self
            .sentiment_windows
            .apply(ALL_MENTIONS, event.event_time, |window_ref, buffer| {
                buffer.push(text);
                window_ref.clone()
            })
            .await?;
        Ok(EventOutcome {
            windows,
            anomalies: Vec::new(),
        })
    }

    /// Spawn a worker consuming raw records of one stream
    ///
    /// The worker stops when the channel closes or the processor shuts down,
    /// and returns the number of records it consumed.
    pub fn spawn_ingestion(
        self: &Arc<Self>,
        stream: StreamKind,
        mut rx: mpsc::Receiver<RawRecord>,
    ) -> JoinHandle<u64> {
        let this = Arc::clone(self);
        let cancel = self.scheduler_cancel.clone();
        tokio::spawn(async move {
            info!(run_id = %this.context.run_id, stream = %stream, "Ingestion worker started");
            let mut consumed = 0u64;
            loop {
                let raw = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    raw = rx.recv() => raw,
                };
                let Some(raw) = raw else { break };
                if raw.stream != stream {
                    warn!(expected = %stream, actual = %raw.stream, "Record on wrong ingestion channel");
                }
                this.ingest_raw(raw).await;
                consumed += 1;
            }
            info!(run_id = %this.context.run_id, stream = %stream, consumed, "Ingestion worker stopped");
            consumed
        })
    }

    /// One cadence step: close expired windows, publish, dispatch triggers
    ///
    /// Fails only when a sink has exhausted its retries.
    pub async fn tick(&self) -> Result<TickReport, ProcessorError> {
        if self.context.config.time_domain == TimeDomain::ProcessingTime {
            let now = Utc::now();
            for watermark in [&self.sales_watermark, &self.mentions_watermark] {
                if watermark.advance(now) {
                    self.metrics.set_watermark(watermark.name(), now.timestamp_millis());
                }
            }
        }

        let windows_closed = self.close_windows(false).await;
        let records_published = self.publish_pending().await?;
        let triggers_dispatched = self.controller.dispatch_pending();
        self.check_sinks()?;

        Ok(TickReport {
            windows_closed,
            records_published,
            triggers_dispatched,
        })
    }

    /// Close every window, publish everything buffered and run all pending triggers
    pub async fn flush(&self) -> Result<TickReport, ProcessorError> {
        let windows_closed = self.close_windows(true).await;
        let records_published = self.publish_pending().await?;
        let before = self.controller.counts().pending;
        self.controller.drain().await;
        self.check_sinks()?;

        info!(
            run_id = %self.context.run_id,
            windows_closed,
            records_published,
            "Flushed processor"
        );
        Ok(TickReport {
            windows_closed,
            records_published,
            triggers_dispatched: before,
        })
    }

    /// Start the cadence scheduler
    pub async fn start(self: &Arc<Self>) -> Result<(), ProcessorError> {
        self.transition(ProcessorState::Running).await?;

        let scheduler = Scheduler::new(
            self.context.config.trigger_cadence_interval,
            self.scheduler_cancel.clone(),
        );
        let task: Arc<dyn CadenceTask> = self.clone();
        *self.scheduler.lock().await = Some(tokio::spawn(scheduler.run(task)));

        info!(
            run_id = %self.context.run_id,
            cadence_ms = self.context.config.trigger_cadence_interval.as_millis() as u64,
            trigger_policy = ?self.context.config.trigger_policy,
            time_domain = ?self.context.config.time_domain,
            "Stream processor started"
        );
        Ok(())
    }

    /// Stop the scheduler and ingestion workers, close and publish every
    /// window, and cancel triggers that have not started
    pub async fn shutdown(&self) -> Result<(), ProcessorError> {
        self.transition(ProcessorState::Draining).await?;
        info!(run_id = %self.context.run_id, "Stream processor shutting down");

        self.scheduler_cancel.cancel();
        let scheduler = self.scheduler.lock().await.take();
        if let Some(handle) = scheduler {
            match handle.await {
                Ok(Ok(ticks)) => debug!(ticks, "Scheduler joined"),
                Ok(Err(e)) => warn!(error = %e, "Scheduler stopped with error"),
                Err(e) => warn!(error = %e, "Scheduler task failed"),
            }
        }

        self.close_windows(true).await;
        let published = self.publish_pending().await;
        self.controller.shutdown().await;
        self.transition(ProcessorState::Stopped).await?;

        let stats = self.stats().await;
        info!(
            run_id = %self.context.run_id,
            events_received = stats.metrics.events_received,
            anomalies = stats.metrics.anomalies_flagged,
            pending_triggers = stats.triggers.pending,
            "Stream processor stopped"
        );
        published?;
        self.check_sinks()
    }

    pub async fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            run_id: self.context.run_id,
            state: self.state().await,
            windows: vec![
                self.forecast_windows.stats(),
                self.anomaly_windows.stats(),
                self.sentiment_windows.stats(),
            ],
            pending_outputs: self.pending_outputs.lock().await.len(),
            queued_mention_batches: self.jobs.queued_batches(),
            triggers: self.controller.counts(),
            metrics: self.context.metrics.snapshot(),
        }
    }

    /// Close expired windows, or all of them when `flush` is set
    async fn close_windows(&self, flush: bool) -> usize {
        let (forecast, anomaly, sentiment) = if flush {
            (
                self.forecast_windows.flush_all().await,
                self.anomaly_windows.flush_all().await,
                self.sentiment_windows.flush_all().await,
            )
        } else {
            (
                self.forecast_windows.close_expired().await,
                self.anomaly_windows.close_expired().await,
                self.sentiment_windows.close_expired().await,
            )
        };
        let closed = forecast.len() + anomaly.len() + sentiment.len();

        let mut outputs = Vec::with_capacity(forecast.len() + anomaly.len());
        for window in &forecast {
            if self.context.config.trigger_policy == TriggerPolicy::OnWindowClose {
                self.controller
                    .request(&TriggerKey::forecast(window.window_ref.partition_key.clone()));
            }
        }
        outputs.extend(forecast.into_iter().map(Self::stats_record));
        outputs.extend(anomaly.into_iter().map(Self::stats_record));

        for window in sentiment {
            if window.accumulator.is_empty() {
                continue;
            }
            let key = self.jobs.enqueue_mentions(MentionBatch {
                window_ref: window.window_ref,
                texts: window.accumulator.texts,
            });
            self.controller.request(&key);
        }

        if !outputs.is_empty() {
            self.pending_outputs.lock().await.extend(outputs);
        }
        if closed > 0 {
            debug!(closed, flush, "Closed windows");
        }
        closed
    }

    fn stats_record(window: ClosedWindow<AggregateStats>) -> OutputRecord {
        OutputRecord::WindowStats(WindowStatsRecord::from(&window.accumulator))
    }

    /// Publish buffered outputs in order; unpublished records stay buffered
    async fn publish_pending(&self) -> Result<usize, ProcessorError> {
        let records = std::mem::take(&mut *self.pending_outputs.lock().await);
        let mut published = 0;

        for (i, record) in records.iter().enumerate() {
            if let Err(e) = self.publisher.publish(record).await {
                let mut pending = self.pending_outputs.lock().await;
                let mut unpublished = records[i..].to_vec();
                unpublished.append(&mut pending);
                *pending = unpublished;
                return Err(e.into());
            }
            published += 1;
        }
        Ok(published)
    }

    fn check_sinks(&self) -> Result<(), ProcessorError> {
        if self.publisher.is_fatal() {
            return Err(SinkWriteError::SinkFailed(self.publisher.failed_sinks().join(",")).into());
        }
        Ok(())
    }
}

#[async_trait]
impl CadenceTask for StreamProcessor {
    async fn tick(&self) -> Result<(), ProcessorError> {
        let report = StreamProcessor::tick(self).await?;
        if report != TickReport::default() {
            debug!(
                windows_closed = report.windows_closed,
                records_published = report.records_published,
                triggers_dispatched = report.triggers_dispatched,
                "Cadence tick"
            );
        }
        Ok(())
    }
}

/// Builder for creating stream processors
pub struct StreamProcessorBuilder {
    config: ProcessorConfig,
    forecaster: Option<Arc<dyn Forecaster>>,
    classifier: Option<Arc<dyn SentimentClassifier>>,
    sinks: Vec<Arc<dyn Sink>>,
}

impl StreamProcessorBuilder {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            forecaster: None,
            classifier: None,
            sinks: Vec::new(),
        }
    }

    /// Replace the default exponential smoothing forecaster
    pub fn with_forecaster(mut self, forecaster: Arc<dyn Forecaster>) -> Self {
        self.forecaster = Some(forecaster);
        self
    }

    /// Replace the default keyword classifier
    pub fn with_classifier(mut self, classifier: Arc<dyn SentimentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Add an output sink; an in-memory sink is used when none is added
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Validate the configuration and build the processor
    pub fn build(self) -> Result<Arc<StreamProcessor>, ProcessorError> {
        self.config.validate()?;
        let context = ProcessorContext::new(self.config);
        let config = &context.config;
        let metrics = Arc::clone(context.metrics.metrics());
        let lateness = config.lateness();

        let sales_watermark = Arc::new(Watermark::new(StreamKind::Sales.as_str()));
        let mentions_watermark = Arc::new(Watermark::new(StreamKind::Mentions.as_str()));

        let forecast_windows = Arc::new(
            WindowManager::new(
                WindowFamily::Forecast,
                Arc::new(TumblingWindowAssigner::new(config.forecast_window())),
                lateness,
                Arc::clone(&sales_watermark),
                Arc::clone(&metrics),
            )
            .with_retained_history(config.retained_history),
        );

        let anomaly_assigner: Arc<dyn WindowAssigner> = match config.anomaly_slide_window() {
            Some(slide) => Arc::new(SlidingWindowAssigner::new(config.anomaly_window(), slide)),
            None => Arc::new(TumblingWindowAssigner::new(config.anomaly_window())),
        };
        let anomaly_windows = Arc::new(WindowManager::new(
            WindowFamily::AnomalyStats,
            anomaly_assigner,
            lateness,
            Arc::clone(&sales_watermark),
            Arc::clone(&metrics),
        ));

        let sentiment_windows = Arc::new(WindowManager::new(
            WindowFamily::Sentiment,
            Arc::new(TumblingWindowAssigner::new(config.sentiment_window())),
            lateness,
            Arc::clone(&mentions_watermark),
            Arc::clone(&metrics),
        ));

        let sinks = if self.sinks.is_empty() {
            vec![Arc::new(InMemorySink::new()) as Arc<dyn Sink>]
        } else {
            self.sinks
        };
        let publisher = Arc::new(OutputPublisher::new(
            sinks,
            config.sink_retry.clone(),
            Arc::clone(&metrics),
        ));

        let series: Arc<dyn SeriesSource> = forecast_windows.clone();
        let jobs = Arc::new(
            DownstreamJobs::new(
                self.forecaster
                    .unwrap_or_else(|| Arc::new(ExponentialSmoothingForecaster::default())),
                self.classifier
                    .unwrap_or_else(|| Arc::new(KeywordSentimentClassifier::default())),
                series,
                Arc::clone(&publisher),
                config.forecast_window(),
                Arc::clone(&metrics),
            )
            .with_live_series(config.trigger_policy == TriggerPolicy::Cadence),
        );
        let job: Arc<dyn TriggerJob> = jobs.clone();
        let controller = Arc::new(TriggerController::new(
            job,
            TriggerControllerConfig {
                max_concurrent: config.max_concurrent_triggers,
                queue_capacity: config.trigger_queue_capacity,
            },
            Arc::clone(&metrics),
        ));

        let scorer = AnomalyScorer::new(AnomalyScorerConfig::from(config), Arc::clone(&metrics));

        info!(
            run_id = %context.run_id,
            forecast_window = ?config.window_size_forecast,
            anomaly_window = ?config.window_size_anomaly_stats,
            sentiment_window = ?config.window_size_sentiment,
            lateness = ?config.lateness_tolerance,
            sinks = publisher.sink_count(),
            "Built stream processor"
        );

        Ok(Arc::new(StreamProcessor {
            state: RwLock::new(ProcessorState::Initialized),
            adapter: EventSourceAdapter::new(),
            sales_watermark,
            mentions_watermark,
            forecast_windows,
            anomaly_windows,
            sentiment_windows,
            scorer,
            jobs,
            controller,
            publisher,
            pending_outputs: Mutex::new(Vec::new()),
            scheduler_cancel: CancellationToken::new(),
            scheduler: Mutex::new(None),
            metrics,
            context,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SentimentLabel;
    use crate::publisher::OutputTable;
    use chrono::{DateTime, Duration, TimeZone};

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(minutes * 60_000).unwrap()
    }

    fn processor() -> (Arc<StreamProcessor>, Arc<InMemorySink>) {
        let sink = Arc::new(InMemorySink::new());
        let processor = StreamProcessorBuilder::new(ProcessorConfig::default())
            .with_sink(sink.clone())
            .build()
            .unwrap();
        (processor, sink)
    }

    #[tokio::test]
    async fn test_sale_updates_both_families() {
        let (processor, _) = processor();
        let outcome = processor
            .process_event(Event::sale(ts(1), "A", 5.0, 1.0, "s1"))
            .await
            .unwrap();

        let families: Vec<_> = outcome.windows.iter().map(|w| w.family).collect();
        assert_eq!(families, vec![WindowFamily::Forecast, WindowFamily::AnomalyStats]);
        assert!(outcome.anomalies.is_empty());
        assert_eq!(processor.watermark(StreamKind::Sales).current(), Some(ts(1)));
        assert_eq!(processor.watermark(StreamKind::Mentions).current(), None);
    }

    #[tokio::test]
    async fn test_malformed_records_are_counted() {
        let (processor, _) = processor();
        let raw = RawRecord::from_json(StreamKind::Sales, r#"{"sku": "A", "quantity": 3}"#).unwrap();

        assert!(processor.ingest_raw(raw).await.is_none());

        let snapshot = processor.stats().await.metrics;
        assert_eq!(snapshot.events_received, 1);
        assert_eq!(snapshot.malformed_records, 1);
        assert_eq!(snapshot.events_accepted, 0);
    }

    #[tokio::test]
    async fn test_late_event_after_close_is_dropped() {
        let (processor, sink) = processor();
        processor
            .process_event(Event::sale(ts(10), "A", 5.0, 1.0, "s1"))
            .await
            .unwrap();
        // Past 1h + 5m lateness for both families
        processor
            .process_event(Event::sale(ts(66), "B", 1.0, 1.0, "s1"))
            .await
            .unwrap();
        let report = processor.tick().await.unwrap();
        assert_eq!(report.windows_closed, 2);
        assert_eq!(sink.len(OutputTable::WindowStats), 2);

        let err = processor
            .process_event(Event::sale(ts(20), "A", 5.0, 1.0, "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Window(WindowError::LateDropped { .. })));
        let snapshot = processor.stats().await.metrics;
        assert_eq!(snapshot.late_events, 1);
        assert_eq!(snapshot.late_window_rejections, 2);
    }

    #[tokio::test]
    async fn test_mentions_are_classified_on_close() {
        let (processor, sink) = processor();
        for (minute, text) in [(1, "love it"), (2, "great phone"), (3, "arrived broken")] {
            processor
                .process_event(Event::mention(ts(minute), text, "twitter"))
                .await
                .unwrap();
        }

        processor.flush().await.unwrap();

        let counts = sink.records(OutputTable::Sentiment);
        assert_eq!(counts.len(), 2);
        let window_end = ts(15).timestamp_millis();
        assert!(sink
            .get(OutputTable::Sentiment, &format!("{window_end}/POSITIVE"))
            .is_some());
        assert!(sink
            .get(OutputTable::Sentiment, &format!("{window_end}/NEGATIVE"))
            .is_some());
    }

    #[tokio::test]
    async fn test_sentiment_counts_span_platforms() {
        let (processor, sink) = processor();
        for (minute, platform) in [(1, "twitter"), (2, "amazon"), (3, "reddit")] {
            processor
                .process_event(Event::mention(ts(minute), "love it", platform))
                .await
                .unwrap();
        }

        processor.flush().await.unwrap();

        assert_eq!(sink.len(OutputTable::Sentiment), 1);
        let key = format!("{}/POSITIVE", ts(15).timestamp_millis());
        let Some(OutputRecord::Sentiment(count)) = sink.get(OutputTable::Sentiment, &key) else {
            panic!("missing positive count");
        };
        assert_eq!(count.count, 3);
        assert_eq!(count.label, SentimentLabel::Positive);
    }

    #[tokio::test]
    async fn test_forecast_runs_on_window_close() {
        let (processor, sink) = processor();
        for (hour, qty) in [(0, 4.0), (1, 6.0)] {
            processor
                .process_event(Event::sale(ts(hour * 60 + 5), "A", qty, 1.0, "s1"))
                .await
                .unwrap();
        }

        processor.flush().await.unwrap();

        let forecasts = sink.records(OutputTable::Forecast);
        assert_eq!(forecasts.len(), 1);
        let OutputRecord::Forecast(record) = &forecasts[0] else {
            panic!("expected forecast record");
        };
        assert_eq!(record.timestamp, ts(0) + Duration::hours(2));
        assert_eq!(record.observed_qty, 6.0);
        assert_eq!(record.history_len, 2);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (processor, _) = processor();
        assert_eq!(processor.state().await, ProcessorState::Initialized);

        processor.start().await.unwrap();
        assert!(processor.start().await.is_err());
        assert_eq!(processor.state().await, ProcessorState::Running);

        processor.shutdown().await.unwrap();
        assert_eq!(processor.state().await, ProcessorState::Stopped);
        assert!(processor
            .process_event(Event::sale(ts(1), "A", 1.0, 1.0, "s1"))
            .await
            .is_err());
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let config = ProcessorConfig {
            anomaly_z_threshold: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            StreamProcessorBuilder::new(config).build(),
            Err(ProcessorError::Config(_))
        ));
    }
}
