//! End-to-end behavior of the stream processor

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use processor::{
    DownstreamError, Event, ForecastRecord, Forecaster, InMemorySink, JsonLinesSink, OutputRecord,
    OutputTable, ProcessorConfig, ProcessorError, RawRecord, RetryPolicy, SeriesPoint, Sink,
    SinkWriteError, StreamKind, StreamProcessor, StreamProcessorBuilder, TimeDomain, TriggerKey,
    TriggerPolicy, TriggerState, WindowError, WindowFamily,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

fn ts(minutes: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(minutes * 60_000).unwrap()
}

fn build(config: ProcessorConfig) -> (Arc<StreamProcessor>, Arc<InMemorySink>) {
    let sink = Arc::new(InMemorySink::new());
    let processor = StreamProcessorBuilder::new(config)
        .with_sink(sink.clone())
        .build()
        .unwrap();
    (processor, sink)
}

/// Counts invocations and the peak number running at once
#[derive(Default)]
struct CountingForecaster {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl Forecaster for CountingForecaster {
    async fn forecast(&self, _key: &str, series: &[SeriesPoint]) -> Result<f64, DownstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(series.last().map_or(0.0, |p| p.value))
    }
}

/// Signals once a forecast starts, then takes a while to finish
#[derive(Default)]
struct SlowForecaster {
    started: Notify,
}

#[async_trait]
impl Forecaster for SlowForecaster {
    async fn forecast(&self, _key: &str, series: &[SeriesPoint]) -> Result<f64, DownstreamError> {
        self.started.notify_one();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok(series.iter().map(|p| p.value).sum())
    }
}

#[derive(Debug)]
struct BrokenSink;

#[async_trait]
impl Sink for BrokenSink {
    fn name(&self) -> &str {
        "broken"
    }

    async fn upsert(
        &self,
        _table: OutputTable,
        _key: &str,
        _record: &OutputRecord,
    ) -> Result<(), SinkWriteError> {
        Err(SinkWriteError::Write {
            sink: "broken".to_string(),
            message: "connection refused".to_string(),
        })
    }
}

#[tokio::test]
async fn test_spike_after_constant_baseline_is_flagged() {
    let forecaster = Arc::new(CountingForecaster::default());
    let sink = Arc::new(InMemorySink::new());
    let processor = StreamProcessorBuilder::new(ProcessorConfig::default())
        .with_forecaster(forecaster.clone())
        .with_sink(sink.clone())
        .build()
        .unwrap();

    let mut flagged = Vec::new();
    for (i, qty) in [5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 50.0].into_iter().enumerate() {
        let event = Event::sale(ts(i as i64 + 1), "A", qty, 2.5, "s1").with_offset(i as u64);
        let outcome = processor.process_event(event).await.unwrap();
        flagged.extend(outcome.anomalies);
    }

    assert_eq!(flagged.len(), 1);
    let record = &flagged[0];
    assert_eq!(record.observed_value, 50.0);
    assert_eq!(record.offset, 9);
    assert_eq!(record.mean_at_time, 5.0);
    assert_eq!(record.stddev_at_time, 0.0);
    assert!(record.z_score.is_infinite() && record.z_score > 0.0);
    assert_eq!(record.store_id.as_deref(), Some("s1"));

    processor.flush().await.unwrap();
    assert_eq!(sink.len(OutputTable::Anomaly), 1);
    let key = format!("A/{}/9/0", ts(10).timestamp_millis());
    assert!(sink.get(OutputTable::Anomaly, &key).is_some());
    assert_eq!(forecaster.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_spikes_without_offsets_keep_separate_rows() {
    let (processor, sink) = build(ProcessorConfig::default());

    let mut flagged = 0;
    for (i, qty) in [5.0, 5.0, 5.0, 50.0, 500.0].into_iter().enumerate() {
        let event = Event::sale(ts(i as i64 + 1), "A", qty, 1.0, "s1");
        flagged += processor.process_event(event).await.unwrap().anomalies.len();
    }
    assert_eq!(flagged, 2);

    processor.flush().await.unwrap();
    let rows = sink.records(OutputTable::Anomaly);
    assert_eq!(rows.len(), 2);
    let mut observed: Vec<f64> = rows
        .iter()
        .filter_map(|r| match r {
            OutputRecord::Anomaly(a) => Some(a.observed_value),
            _ => None,
        })
        .collect();
    observed.sort_by(f64::total_cmp);
    assert_eq!(observed, vec![50.0, 500.0]);
}

#[tokio::test]
async fn test_z_score_matches_two_pass_baseline() {
    let (processor, _) = build(ProcessorConfig::default());
    let baseline = [4.0, 6.0, 4.0, 6.0, 4.0, 6.0, 4.0, 6.0, 4.0];

    for (i, qty) in baseline.iter().enumerate() {
        let event = Event::sale(ts(i as i64), "A", *qty, 1.0, "s1");
        let outcome = processor.process_event(event).await.unwrap();
        assert!(outcome.anomalies.is_empty(), "baseline value {i} flagged");
    }

    let outcome = processor
        .process_event(Event::sale(ts(20), "A", 50.0, 1.0, "s1"))
        .await
        .unwrap();

    let n = baseline.len() as f64;
    let mean = baseline.iter().sum::<f64>() / n;
    let var = baseline.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let expected = (50.0 - mean) / var.sqrt();

    assert_eq!(outcome.anomalies.len(), 1);
    let record = &outcome.anomalies[0];
    assert!((record.mean_at_time - mean).abs() < 1e-9);
    assert!((record.z_score - expected).abs() < 1e-9);
}

#[tokio::test]
async fn test_lateness_boundary() {
    let (processor, _) = build(ProcessorConfig::default());
    processor
        .process_event(Event::sale(ts(10), "A", 1.0, 1.0, "s1"))
        .await
        .unwrap();

    // Watermark exactly at end + lateness of the first forecast window
    processor
        .process_event(Event::sale(ts(65), "B", 1.0, 1.0, "s1"))
        .await
        .unwrap();
    let outcome = processor
        .process_event(Event::sale(ts(20), "A", 1.0, 1.0, "s1"))
        .await
        .unwrap();
    let families: Vec<_> = outcome.windows.iter().map(|w| w.family).collect();
    assert_eq!(families, vec![WindowFamily::Forecast]);

    // One millisecond past it
    processor
        .process_event(Event::sale(
            ts(65) + Duration::milliseconds(1),
            "B",
            1.0,
            1.0,
            "s1",
        ))
        .await
        .unwrap();
    let err = processor
        .process_event(Event::sale(ts(20), "A", 1.0, 1.0, "s1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::Window(WindowError::LateDropped { .. })
    ));

    let snapshot = processor.stats().await.metrics;
    // Only the last event was dropped outright
    assert_eq!(snapshot.late_events, 1);
    // Anomaly window refused the accepted event; both families refused the last
    assert_eq!(snapshot.late_window_rejections, 3);
}

#[tokio::test]
async fn test_forecast_invoked_once_per_window_close() {
    let forecaster = Arc::new(CountingForecaster::default());
    let sink = Arc::new(InMemorySink::new());
    let processor = StreamProcessorBuilder::new(ProcessorConfig::default())
        .with_forecaster(forecaster.clone())
        .with_sink(sink.clone())
        .build()
        .unwrap();

    for minute in [1, 10, 20, 30] {
        processor
            .process_event(Event::sale(ts(minute), "A", 3.0, 1.0, "s1"))
            .await
            .unwrap();
    }
    processor.tick().await.unwrap();
    assert_eq!(forecaster.calls.load(Ordering::SeqCst), 0);

    processor.flush().await.unwrap();
    assert_eq!(forecaster.calls.load(Ordering::SeqCst), 1);

    let Some(OutputRecord::Forecast(record)) = sink.get(
        OutputTable::Forecast,
        &format!("A/{}", ts(60).timestamp_millis()),
    ) else {
        panic!("missing forecast for A");
    };
    assert_eq!(record.forecast_qty, 12.0);
    assert_eq!(record.history_len, 1);

    processor.flush().await.unwrap();
    assert_eq!(forecaster.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cadence_triggers_never_overlap_per_key() {
    let forecaster = Arc::new(CountingForecaster::default());
    let config = ProcessorConfig {
        trigger_policy: TriggerPolicy::Cadence,
        ..Default::default()
    };
    let processor = StreamProcessorBuilder::new(config)
        .with_forecaster(forecaster.clone())
        .build()
        .unwrap();

    let mut ticks = Vec::new();
    for i in 0..50 {
        processor
            .process_event(Event::sale(ts(i), "A", 1.0, 1.0, "s1"))
            .await
            .unwrap();
        let processor = processor.clone();
        ticks.push(tokio::spawn(async move { processor.tick().await }));
    }
    for tick in ticks {
        tick.await.unwrap().unwrap();
    }
    processor.flush().await.unwrap();

    assert!(forecaster.calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(forecaster.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(
        processor.controller().state(&TriggerKey::forecast("A")),
        TriggerState::Idle
    );
}

#[tokio::test]
async fn test_republishing_keeps_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let jsonl = Arc::new(JsonLinesSink::create(dir.path()).await.unwrap());
    let memory = Arc::new(InMemorySink::new());
    let processor = StreamProcessorBuilder::new(ProcessorConfig::default())
        .with_sink(jsonl.clone())
        .with_sink(memory.clone())
        .build()
        .unwrap();

    let record = OutputRecord::Forecast(ForecastRecord {
        timestamp: ts(60),
        partition_key: "A".to_string(),
        observed_qty: 4.0,
        forecast_qty: 4.5,
        history_len: 3,
    });
    processor.publisher().publish(&record).await.unwrap();
    processor.publisher().publish(&record).await.unwrap();

    assert_eq!(memory.len(OutputTable::Forecast), 1);
    let contents = tokio::fs::read_to_string(jsonl.path_for(OutputTable::Forecast))
        .await
        .unwrap();
    assert_eq!(contents.lines().count(), 1);
}

#[tokio::test]
async fn test_exhausted_sink_is_fatal() {
    let config = ProcessorConfig {
        sink_retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(2),
            multiplier: 2.0,
        },
        ..Default::default()
    };
    let processor = StreamProcessorBuilder::new(config)
        .with_sink(Arc::new(BrokenSink))
        .build()
        .unwrap();

    processor
        .process_event(Event::sale(ts(1), "A", 1.0, 1.0, "s1"))
        .await
        .unwrap();
    processor
        .process_event(Event::sale(ts(120), "A", 1.0, 1.0, "s1"))
        .await
        .unwrap();

    let err = processor.tick().await.unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::Sink(SinkWriteError::RetriesExhausted { attempts: 3, .. })
    ));
    assert!(processor.publisher().is_fatal());

    // Unpublished records stay buffered
    assert!(processor.stats().await.pending_outputs > 0);
    assert!(matches!(
        processor.tick().await,
        Err(ProcessorError::Sink(SinkWriteError::SinkFailed(_)))
    ));
}

#[tokio::test]
async fn test_ingestion_counts_malformed_records() {
    let (processor, sink) = build(ProcessorConfig::default());
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let worker = processor.spawn_ingestion(StreamKind::Mentions, rx);

    let records = [
        vec![("timestamp", "2024-03-01T10:00:00Z"), ("text", "love this"), ("platform", "twitter")],
        vec![("timestamp", "not a time"), ("text", "great"), ("platform", "twitter")],
        vec![("timestamp", "2024-03-01T10:01:00Z"), ("platform", "twitter")],
        vec![("timestamp", "2024-03-01T10:02:00Z"), ("text", "totally broken"), ("platform", "twitter")],
    ];
    for pairs in records {
        tx.send(RawRecord::from_pairs(StreamKind::Mentions, pairs))
            .await
            .unwrap();
    }
    drop(tx);

    assert_eq!(worker.await.unwrap(), 4);
    let snapshot = processor.stats().await.metrics;
    assert_eq!(snapshot.events_received, 4);
    assert_eq!(snapshot.malformed_records, 2);
    assert_eq!(snapshot.events_accepted, 2);

    processor.flush().await.unwrap();
    assert_eq!(sink.len(OutputTable::Sentiment), 2);
}

#[tokio::test]
async fn test_sliding_baselines_score_independently() {
    let config = ProcessorConfig {
        window_size_anomaly_stats: std::time::Duration::from_secs(30 * 60),
        anomaly_slide: Some(std::time::Duration::from_secs(10 * 60)),
        ..Default::default()
    };
    let (processor, sink) = build(config);

    for minute in [21, 22, 23] {
        let outcome = processor
            .process_event(Event::sale(ts(minute), "A", 5.0, 1.0, "s1"))
            .await
            .unwrap();
        // One forecast window plus the three overlapping baselines
        assert_eq!(outcome.windows.len(), 4);
        assert!(outcome.anomalies.is_empty());
    }

    let outcome = processor
        .process_event(Event::sale(ts(24), "A", 50.0, 1.0, "s1"))
        .await
        .unwrap();
    assert_eq!(outcome.anomalies.len(), 3);
    let starts: BTreeSet<_> = outcome
        .anomalies
        .iter()
        .map(|r| r.window_ref.bounds.start)
        .collect();
    assert_eq!(starts, BTreeSet::from([ts(0), ts(10), ts(20)]));
    assert!(outcome.anomalies.iter().all(|r| r.mean_at_time == 5.0));

    processor.flush().await.unwrap();
    assert_eq!(sink.len(OutputTable::Anomaly), 3);
    assert_eq!(processor.stats().await.metrics.anomalies_flagged, 3);
}

#[tokio::test]
async fn test_processing_time_watermark_advances_on_tick() {
    let config = ProcessorConfig {
        time_domain: TimeDomain::ProcessingTime,
        ..Default::default()
    };
    let (processor, sink) = build(config);

    processor
        .process_event(Event::sale(ts(1), "A", 2.0, 1.0, "s1"))
        .await
        .unwrap();
    // Event times never move a processing-time watermark
    assert_eq!(processor.watermark(StreamKind::Sales).current(), None);

    let before = chrono::Utc::now();
    let report = processor.tick().await.unwrap();

    for stream in [StreamKind::Sales, StreamKind::Mentions] {
        let watermark = processor.watermark(stream).current_millis().unwrap();
        assert!(watermark >= before.timestamp_millis());
    }
    assert_eq!(report.windows_closed, 2);
    assert_eq!(sink.len(OutputTable::WindowStats), 2);

    let err = processor
        .process_event(Event::sale(ts(2), "A", 2.0, 1.0, "s1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::Window(WindowError::LateDropped { .. })
    ));
}

#[tokio::test]
async fn test_shutdown_lets_running_forecast_publish() {
    let forecaster = Arc::new(SlowForecaster::default());
    let sink = Arc::new(InMemorySink::new());
    let processor = StreamProcessorBuilder::new(ProcessorConfig::default())
        .with_forecaster(forecaster.clone())
        .with_sink(sink.clone())
        .build()
        .unwrap();

    processor
        .process_event(Event::sale(ts(5), "A", 4.0, 1.0, "s1"))
        .await
        .unwrap();
    // Moves the watermark past the first hour plus lateness
    processor
        .process_event(Event::sale(ts(70), "B", 1.0, 1.0, "s1"))
        .await
        .unwrap();
    let report = processor.tick().await.unwrap();
    assert_eq!(report.triggers_dispatched, 1);

    forecaster.started.notified().await;
    processor.shutdown().await.unwrap();

    let Some(OutputRecord::Forecast(record)) = sink.get(
        OutputTable::Forecast,
        &format!("A/{}", ts(60).timestamp_millis()),
    ) else {
        panic!("running forecast was not published");
    };
    assert_eq!(record.forecast_qty, 4.0);
    assert_eq!(
        processor.controller().state(&TriggerKey::forecast("A")),
        TriggerState::Idle
    );
}
