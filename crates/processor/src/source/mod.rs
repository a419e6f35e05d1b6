//! Event source adapter and feed readers

pub mod adapter;
pub mod csv;

pub use adapter::{parse_timestamp, EventSourceAdapter, RawRecord};
pub use self::csv::CsvRecordReader;
