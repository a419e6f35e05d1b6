//! Incremental aggregation
//!
//! Window accumulators updated in place as events are admitted:
//! - [`AggregateStats`]: count, sum, sum of squares, mean and variance
//! - [`MentionBuffer`]: mention texts awaiting batch classification

pub mod mention;
pub mod stats;

pub use mention::{MentionBuffer, ALL_MENTIONS};
pub use stats::{AggregateStats, IncrementalAggregator};
