//! Stream processor for flash sale insights
//!
//! This crate ingests sales and mention feeds, maintains windowed
//! statistics per partition key, flags anomalous sales as they arrive and
//! drives forecast and sentiment computations whose results are published
//! idempotently to output tables.

pub mod aggregation;
pub mod analyzer;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod model;
pub mod publisher;
pub mod source;
pub mod stream_processor;
pub mod telemetry;
pub mod trigger;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use core::{Event, EventKind, EventPayload, MentionPayload, SalePayload, StreamKind};

pub use source::{CsvRecordReader, EventSourceAdapter, RawRecord};

pub use watermark::{TimeDomain, Watermark};

pub use window::{
    ClosedWindow, ManagerStats, SlidingWindowAssigner, TumblingWindowAssigner, Window,
    WindowAccumulator, WindowAssigner, WindowBounds, WindowFamily, WindowManager, WindowRef,
    WindowState, WindowType,
};

pub use aggregation::{AggregateStats, IncrementalAggregator, MentionBuffer, ALL_MENTIONS};

pub use analyzer::{AnomalyRecord, AnomalyScorer, AnomalyScorerConfig, ScoreOutcome, Severity};

pub use model::{
    ExponentialSmoothingForecaster, Forecaster, KeywordSentimentClassifier, SentimentClassifier,
    SentimentLabel, SeriesPoint,
};

pub use trigger::{
    CadenceTask, DownstreamJobs, MentionBatch, Scheduler, SeriesSource, TriggerController,
    TriggerControllerConfig, TriggerCounts, TriggerJob, TriggerKey, TriggerKind, TriggerState,
};

pub use publisher::{
    ForecastRecord, InMemorySink, JsonLinesSink, OutputPublisher, OutputRecord, OutputTable,
    RetryPolicy, SentimentCount, Sink, WindowStatsRecord,
};

pub use stream_processor::{
    EventOutcome, ProcessorContext, ProcessorState, ProcessorStats, StreamProcessor,
    StreamProcessorBuilder, TickReport,
};

pub use error::{
    AggregationError, ConfigError, DownstreamError, MalformedRecordError, ProcessorError, Result,
    SinkWriteError, SourceError, TriggerError, WindowError,
};

pub use config::{LoggingConfig, ProcessorConfig, TriggerPolicy};

pub use metrics::{MetricsRegistry, MetricsSnapshot, PipelineMetrics};

pub use telemetry::init_tracing;
