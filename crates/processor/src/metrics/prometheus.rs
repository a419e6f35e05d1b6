//! Prometheus metrics definitions for the insight processor
//!
//! Metric names follow the `processor_<subsystem>_<name>` convention. Label
//! sets are `Vec<(String, String)>` built from [`LabelNames`].

use super::labels::{label, LabelNames, ResultLabel};
use crate::core::StreamKind;
use crate::publisher::OutputTable;
use crate::trigger::TriggerKind;
use crate::window::WindowFamily;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64};

type CounterFamily = Family<Vec<(String, String)>, Counter<u64, AtomicU64>>;
type GaugeFamily = Family<Vec<(String, String)>, Gauge<i64, AtomicI64>>;

/// Metrics of the insight processor
pub struct PipelineMetrics {
    // === Ingestion ===
    /// Raw records received, by stream
    pub events_received_total: CounterFamily,

    /// Events admitted into at least one window, by stream
    pub events_accepted_total: CounterFamily,

    /// Records rejected by the source adapter, by stream
    pub malformed_records_total: CounterFamily,

    /// Duration of per-event processing in seconds, by stream
    pub event_processing_duration_seconds: Family<Vec<(String, String)>, Histogram>,

    /// Current watermark in epoch milliseconds, by stream
    pub watermark_millis: GaugeFamily,

    // === Windows ===
    /// Windows created, by family
    pub windows_created_total: CounterFamily,

    /// Windows closed, by family
    pub windows_closed_total: CounterFamily,

    /// Live windows, by family
    pub windows_active: GaugeFamily,

    /// Window admissions refused as late, by family. An event refused by
    /// several families counts once in each.
    pub late_window_rejections_total: CounterFamily,

    /// Events no window accepted, counted once per event, by stream
    pub events_late_dropped_total: CounterFamily,

    // === Anomalies ===
    /// Events flagged as anomalous
    pub anomalies_flagged_total: Counter<u64, AtomicU64>,

    /// Scoring attempts skipped for lack of baseline statistics
    pub insufficient_statistics_total: Counter<u64, AtomicU64>,

    // === Triggers ===
    /// Downstream invocations, by kind and result
    pub trigger_invocations_total: CounterFamily,

    /// Invocations currently running
    pub triggers_in_flight: Gauge<i64, AtomicI64>,

    /// Keys waiting for an invocation
    pub triggers_pending: Gauge<i64, AtomicI64>,

    /// Mention texts the classifier failed on
    pub sentiment_texts_skipped_total: Counter<u64, AtomicU64>,

    // === Sinks ===
    /// Sink writes, by table and final result
    pub sink_writes_total: CounterFamily,

    /// Sink write retries, by table
    pub sink_retries_total: CounterFamily,
}

impl PipelineMetrics {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            events_received_total: Family::default(),
            events_accepted_total: Family::default(),
            malformed_records_total: Family::default(),
            event_processing_duration_seconds: Family::new_with_constructor(Self::duration_histogram),
            watermark_millis: Family::default(),

            windows_created_total: Family::default(),
            windows_closed_total: Family::default(),
            windows_active: Family::default(),
            late_window_rejections_total: Family::default(),
            events_late_dropped_total: Family::default(),

            anomalies_flagged_total: Counter::default(),
            insufficient_statistics_total: Counter::default(),

            trigger_invocations_total: Family::default(),
            triggers_in_flight: Gauge::default(),
            triggers_pending: Gauge::default(),
            sentiment_texts_skipped_total: Counter::default(),

            sink_writes_total: Family::default(),
            sink_retries_total: Family::default(),
        };

        registry.register(
            "processor_events_received",
            "Raw records received by stream",
            metrics.events_received_total.clone(),
        );
        registry.register(
            "processor_events_accepted",
            "Events admitted into at least one window by stream",
            metrics.events_accepted_total.clone(),
        );
        registry.register(
            "processor_malformed_records",
            "Records rejected by the source adapter by stream",
            metrics.malformed_records_total.clone(),
        );
        registry.register(
            "processor_event_processing_duration_seconds",
            "Duration of per-event processing",
            metrics.event_processing_duration_seconds.clone(),
        );
        registry.register(
            "processor_watermark_millis",
            "Current watermark in epoch milliseconds by stream",
            metrics.watermark_millis.clone(),
        );
        registry.register(
            "processor_windows_created",
            "Windows created by family",
            metrics.windows_created_total.clone(),
        );
        registry.register(
            "processor_windows_closed",
            "Windows closed by family",
            metrics.windows_closed_total.clone(),
        );
        registry.register(
            "processor_windows_active",
            "Live windows by family",
            metrics.windows_active.clone(),
        );
        registry.register(
            "processor_late_window_rejections",
            "Window admissions refused as late by family; one event may count in several families",
            metrics.late_window_rejections_total.clone(),
        );
        registry.register(
            "processor_events_late_dropped",
            "Events dropped because no window accepted them, once per event by stream",
            metrics.events_late_dropped_total.clone(),
        );
        registry.register(
            "processor_anomalies_flagged",
            "Events flagged as anomalous",
            metrics.anomalies_flagged_total.clone(),
        );
        registry.register(
            "processor_insufficient_statistics",
            "Scoring attempts skipped for lack of baseline statistics",
            metrics.insufficient_statistics_total.clone(),
        );
        registry.register(
            "processor_trigger_invocations",
            "Downstream invocations by kind and result",
            metrics.trigger_invocations_total.clone(),
        );
        registry.register(
            "processor_triggers_in_flight",
            "Downstream invocations currently running",
            metrics.triggers_in_flight.clone(),
        );
        registry.register(
            "processor_triggers_pending",
            "Keys waiting for a downstream invocation",
            metrics.triggers_pending.clone(),
        );
        registry.register(
            "processor_sentiment_texts_skipped",
            "Mention texts the classifier failed on",
            metrics.sentiment_texts_skipped_total.clone(),
        );
        registry.register(
            "processor_sink_writes",
            "Sink writes by table and result",
            metrics.sink_writes_total.clone(),
        );
        registry.register(
            "processor_sink_retries",
            "Sink write retries by table",
            metrics.sink_retries_total.clone(),
        );

        metrics
    }

    // === Convenience methods ===

    #[inline]
    pub fn record_event_received(&self, stream: StreamKind) {
        self.events_received_total
            .get_or_create(&label(LabelNames::STREAM, stream))
            .inc();
    }

    #[inline]
    pub fn record_event_accepted(&self, stream: StreamKind) {
        self.events_accepted_total
            .get_or_create(&label(LabelNames::STREAM, stream))
            .inc();
    }

    #[inline]
    pub fn record_malformed(&self, stream: StreamKind) {
        self.malformed_records_total
            .get_or_create(&label(LabelNames::STREAM, stream))
            .inc();
    }

    #[inline]
    pub fn record_event_processing_duration(&self, stream: StreamKind, duration_secs: f64) {
        self.event_processing_duration_seconds
            .get_or_create(&label(LabelNames::STREAM, stream))
            .observe(duration_secs);
    }

    #[inline]
    pub fn set_watermark(&self, stream: &str, millis: i64) {
        self.watermark_millis
            .get_or_create(&label(LabelNames::STREAM, stream))
            .set(millis);
    }

    #[inline]
    pub fn record_window_created(&self, family: WindowFamily) {
        self.windows_created_total
            .get_or_create(&label(LabelNames::FAMILY, family))
            .inc();
    }

    #[inline]
    pub fn record_window_closed(&self, family: WindowFamily) {
        self.windows_closed_total
            .get_or_create(&label(LabelNames::FAMILY, family))
            .inc();
    }

    #[inline]
    pub fn set_windows_active(&self, family: WindowFamily, count: i64) {
        self.windows_active
            .get_or_create(&label(LabelNames::FAMILY, family))
            .set(count);
    }

    #[inline]
    pub fn record_late_rejection(&self, family: WindowFamily) {
        self.late_window_rejections_total
            .get_or_create(&label(LabelNames::FAMILY, family))
            .inc();
    }

    #[inline]
    pub fn record_event_late_dropped(&self, stream: StreamKind) {
        self.events_late_dropped_total
            .get_or_create(&label(LabelNames::STREAM, stream))
            .inc();
    }

    #[inline]
    pub fn record_anomaly_flagged(&self) {
        self.anomalies_flagged_total.inc();
    }

    #[inline]
    pub fn record_insufficient_statistics(&self) {
        self.insufficient_statistics_total.inc();
    }

    #[inline]
    pub fn record_trigger_invocation(&self, kind: TriggerKind, result: ResultLabel) {
        self.trigger_invocations_total
            .get_or_create(&vec![
                (LabelNames::KIND.to_string(), kind.to_string()),
                (LabelNames::RESULT.to_string(), result.to_string()),
            ])
            .inc();
    }

    #[inline]
    pub fn set_triggers_in_flight(&self, count: i64) {
        self.triggers_in_flight.set(count);
    }

    #[inline]
    pub fn set_triggers_pending(&self, count: i64) {
        self.triggers_pending.set(count);
    }

    #[inline]
    pub fn record_sentiment_text_skipped(&self) {
        self.sentiment_texts_skipped_total.inc();
    }

    #[inline]
    pub fn record_sink_write(&self, table: OutputTable, result: ResultLabel) {
        self.sink_writes_total
            .get_or_create(&vec![
                (LabelNames::TABLE.to_string(), table.to_string()),
                (LabelNames::RESULT.to_string(), result.to_string()),
            ])
            .inc();
    }

    #[inline]
    pub fn record_sink_retry(&self, table: OutputTable) {
        self.sink_retries_total
            .get_or_create(&label(LabelNames::TABLE, table))
            .inc();
    }

    /// Duration histograms from 100µs to about 3s
    fn duration_histogram() -> Histogram {
        Histogram::new(exponential_buckets(0.0001, 2.0, 16))
    }
}

/// Point-in-time totals for stats reporting and tests
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_accepted: u64,
    pub malformed_records: u64,
    /// Events dropped as late, once per event
    pub late_events: u64,
    /// Late refusals per family, summed
    pub late_window_rejections: u64,
    pub anomalies_flagged: u64,
    pub trigger_failures: u64,
    pub sentiment_texts_skipped: u64,
}

impl MetricsSnapshot {
    pub fn capture(metrics: &PipelineMetrics) -> Self {
        const STREAMS: [StreamKind; 2] = [StreamKind::Sales, StreamKind::Mentions];
        const FAMILIES: [WindowFamily; 3] = [
            WindowFamily::Forecast,
            WindowFamily::AnomalyStats,
            WindowFamily::Sentiment,
        ];
        const KINDS: [TriggerKind; 2] = [TriggerKind::Forecast, TriggerKind::Sentiment];

        let per_stream = |family: &CounterFamily| -> u64 {
            STREAMS
                .iter()
                .map(|s| family.get_or_create(&label(LabelNames::STREAM, s)).get())
                .sum()
        };

        Self {
            events_received: per_stream(&metrics.events_received_total),
            events_accepted: per_stream(&metrics.events_accepted_total),
            malformed_records: per_stream(&metrics.malformed_records_total),
            late_events: per_stream(&metrics.events_late_dropped_total),
            late_window_rejections: FAMILIES
                .iter()
                .map(|f| {
                    metrics
                        .late_window_rejections_total
                        .get_or_create(&label(LabelNames::FAMILY, f))
                        .get()
                })
                .sum(),
            anomalies_flagged: metrics.anomalies_flagged_total.get(),
            trigger_failures: KINDS
                .iter()
                .flat_map(|k| [(k, ResultLabel::Failure), (k, ResultLabel::Panicked)])
                .map(|(k, r)| {
                    metrics
                        .trigger_invocations_total
                        .get_or_create(&vec![
                            (LabelNames::KIND.to_string(), k.to_string()),
                            (LabelNames::RESULT.to_string(), r.to_string()),
                        ])
                        .get()
                })
                .sum(),
            sentiment_texts_skipped: metrics.sentiment_texts_skipped_total.get(),
        }
    }
}
