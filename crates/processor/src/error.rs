//! Error types for the insight processor
//!
//! Each component owns one error enum. They all convert into
//! [`ProcessorError`] so callers at the edge can use a single result type.

use crate::window::WindowFamily;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Top-level processor error
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Input record could not be normalized
    #[error("Malformed record: {0}")]
    Malformed(#[from] MalformedRecordError),

    /// Input feed could not be read
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Window admission or lookup failed
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Aggregate update failed
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Downstream trigger invocation failed
    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    /// Output sink write failed
    #[error("Sink error: {0}")]
    Sink(#[from] SinkWriteError),

    /// Configuration is invalid or unreadable
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Lifecycle method called in the wrong state
    #[error("Invalid processor state transition from {from} to {to}")]
    InvalidState { from: String, to: String },
}

/// Raised by the event source adapter for records that do not match the
/// expected shape. Such records are skipped and counted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedRecordError {
    /// A required field is absent or empty
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    /// Timestamp could not be parsed in any accepted format
    #[error("unparsable timestamp '{value}'")]
    InvalidTimestamp { value: String },

    /// Numeric field is not a finite number
    #[error("field '{field}' is not a finite number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    /// JSON payload was not an object
    #[error("record is not an object")]
    NotAnObject,

    /// JSON payload could not be parsed
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

/// Errors reading a raw input feed
#[derive(Error, Debug)]
pub enum SourceError {
    /// CSV decoding failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv_async::Error),

    /// Underlying reader failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Downstream channel was closed
    #[error("record channel closed")]
    ChannelClosed,
}

/// Window admission and lookup errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WindowError {
    /// Event fell outside every admissible window (late-dropped event)
    #[error(
        "late event dropped for {family} key '{partition_key}': event_time={event_time}, watermark={watermark:?}"
    )]
    LateDropped {
        family: WindowFamily,
        partition_key: String,
        event_time: DateTime<Utc>,
        watermark: Option<DateTime<Utc>>,
    },

    /// Window is closed and may no longer be mutated
    #[error("window {0} is closed")]
    WindowClosed(String),

    /// Window does not exist
    #[error("window {0} not found")]
    WindowNotFound(String),
}

/// Incremental aggregation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    /// Value is NaN or infinite
    #[error("cannot aggregate non-finite value {0}")]
    NonFiniteValue(f64),

    /// Owning window rejected the update
    #[error(transparent)]
    Window(#[from] WindowError),
}

/// Failure of a pluggable forecast or sentiment function
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DownstreamError {
    /// Function returned an error
    #[error("{component} failed: {message}")]
    Failed { component: String, message: String },

    /// Function panicked
    #[error("{component} panicked")]
    Panicked { component: String },

    /// No input to compute from
    #[error("empty input series for '{0}'")]
    EmptySeries(String),
}

impl DownstreamError {
    /// Convenience constructor for a failed computation
    pub fn failed(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Errors from a single trigger invocation
#[derive(Error, Debug)]
pub enum TriggerError {
    /// Pluggable function failed
    #[error(transparent)]
    Downstream(#[from] DownstreamError),

    /// Result could not be published
    #[error(transparent)]
    Publish(#[from] SinkWriteError),

    /// Invocation observed shutdown and discarded partial work
    #[error("trigger cancelled")]
    Cancelled,
}

/// Output sink errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkWriteError {
    /// A single write attempt failed
    #[error("write to sink '{sink}' failed: {message}")]
    Write { sink: String, message: String },

    /// Every retry failed; the sink is now considered fatal
    #[error("sink '{sink}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        sink: String,
        attempts: u32,
        last_error: String,
    },

    /// Sink previously exhausted its retries
    #[error("sink '{0}' is in a failed state")]
    SinkFailed(String),

    /// Record could not be serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for SinkWriteError {
    fn from(err: std::io::Error) -> Self {
        SinkWriteError::Write {
            sink: "io".to_string(),
            message: err.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Log subscriber could not be installed
    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: ProcessorError = MalformedRecordError::MissingField { field: "sku" }.into();
        assert!(matches!(err, ProcessorError::Malformed(_)));
        assert_eq!(
            err.to_string(),
            "Malformed record: missing required field 'sku'"
        );

        let err: AggregationError = WindowError::WindowClosed("w".to_string()).into();
        assert!(matches!(err, AggregationError::Window(_)));
    }

    #[test]
    fn test_downstream_error_display() {
        let err = DownstreamError::failed("forecaster", "boom");
        assert_eq!(err.to_string(), "forecaster failed: boom");

        let trigger: TriggerError = err.into();
        assert_eq!(trigger.to_string(), "forecaster failed: boom");
    }
}
