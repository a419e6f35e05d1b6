//! Prometheus metrics
//!
//! [`PipelineMetrics`] holds every counter, gauge and histogram the processor
//! updates. [`MetricsRegistry`] owns the registry they are registered with
//! and renders it in the text exposition format.

pub mod labels;
pub mod prometheus;

pub use labels::{LabelNames, ResultLabel};
pub use prometheus::{MetricsSnapshot, PipelineMetrics};

use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// Registry paired with the metrics registered in it
pub struct MetricsRegistry {
    registry: Registry,
    metrics: Arc<PipelineMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("insight");
        let metrics = Arc::new(PipelineMetrics::new(&mut registry));
        Self { registry, metrics }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::capture(&self.metrics)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StreamKind;

    #[test]
    fn test_encode_contains_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.metrics().record_event_received(StreamKind::Sales);

        let text = registry.encode().unwrap();
        assert!(text.contains("insight_processor_events_received_total{stream=\"sales\"} 1"));
        assert!(text.contains("insight_processor_events_late_dropped"));
        assert!(text.contains("insight_processor_late_window_rejections"));
        assert_eq!(registry.snapshot().events_received, 1);
    }
}
