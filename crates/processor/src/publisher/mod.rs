//! Output Publisher
//!
//! Writes output records to every configured sink. Writes are idempotent
//! upserts keyed by [`OutputRecord::record_key`], so the trigger controller
//! may safely re-run an invocation whose publish failed.
//!
//! Each write is retried with exponential backoff. A sink that exhausts its
//! retries is marked failed and rejects every later write; the other sinks
//! keep receiving records, and [`OutputPublisher::is_fatal`] reports the
//! condition to the processor.

pub mod record;
pub mod retry;
pub mod sink;

pub use record::{ForecastRecord, OutputRecord, OutputTable, SentimentCount, WindowStatsRecord};
pub use retry::RetryPolicy;
pub use sink::{InMemorySink, JsonLinesSink, Sink};

use crate::error::SinkWriteError;
use crate::metrics::{PipelineMetrics, ResultLabel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

struct SinkSlot {
    sink: Arc<dyn Sink>,
    failed: AtomicBool,
}

/// Publishes output records to a set of sinks
pub struct OutputPublisher {
    sinks: Vec<SinkSlot>,
    policy: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl OutputPublisher {
    pub fn new(sinks: Vec<Arc<dyn Sink>>, policy: RetryPolicy, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            sinks: sinks
                .into_iter()
                .map(|sink| SinkSlot {
                    sink,
                    failed: AtomicBool::new(false),
                })
                .collect(),
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upsert `record` into every sink
    ///
    /// Returns the first error seen; healthy sinks are still written.
    pub async fn publish(&self, record: &OutputRecord) -> Result<(), SinkWriteError> {
        let table = record.table();
        let key = record.record_key();
        let mut first_error = None;

        for slot in &self.sinks {
            if let Err(e) = self.publish_to(slot, table, &key, record).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn publish_to(
        &self,
        slot: &SinkSlot,
        table: OutputTable,
        key: &str,
        record: &OutputRecord,
    ) -> Result<(), SinkWriteError> {
        let name = slot.sink.name();
        if slot.failed.load(Ordering::Acquire) {
            return Err(SinkWriteError::SinkFailed(name.to_string()));
        }

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            match slot.sink.upsert(table, key, record).await {
                Ok(()) => {
                    self.metrics.record_sink_write(table, ResultLabel::Success);
                    debug!(sink = name, table = %table, key, attempt, "Published record");
                    return Ok(());
                }
                // Serialization never succeeds on retry
                Err(e @ SinkWriteError::Serialization(_)) => {
                    self.metrics.record_sink_write(table, ResultLabel::Failure);
                    error!(sink = name, table = %table, key, error = %e, "Record cannot be serialized");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    self.metrics.record_sink_write(table, ResultLabel::Failure);
                    slot.failed.store(true, Ordering::Release);
                    error!(
                        sink = name,
                        table = %table,
                        key,
                        attempts = attempt,
                        error = %e,
                        "Sink retries exhausted, marking sink failed"
                    );
                    return Err(SinkWriteError::RetriesExhausted {
                        sink: name.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let backoff = self.policy.backoff(attempt);
                    self.metrics.record_sink_retry(table);
                    warn!(
                        sink = name,
                        table = %table,
                        key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Sink write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// True once any sink has exhausted its retries
    pub fn is_fatal(&self) -> bool {
        self.sinks.iter().any(|s| s.failed.load(Ordering::Acquire))
    }

    /// Names of failed sinks
    pub fn failed_sinks(&self) -> Vec<String> {
        self.sinks
            .iter()
            .filter(|s| s.failed.load(Ordering::Acquire))
            .map(|s| s.sink.name().to_string())
            .collect()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}
