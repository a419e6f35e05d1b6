//! Pluggable downstream models
//!
//! The processor only decides *when* these run. Implementations are supplied
//! at construction; the defaults here are small and dependency-free.

pub mod forecast;
pub mod sentiment;

pub use forecast::{ExponentialSmoothingForecaster, Forecaster, SeriesPoint};
pub use sentiment::{KeywordSentimentClassifier, SentimentClassifier, SentimentLabel};
