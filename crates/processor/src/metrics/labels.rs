//! Metric label names and values

use std::fmt;

/// Label keys shared by metric families
pub struct LabelNames;

impl LabelNames {
    pub const STREAM: &'static str = "stream";
    pub const FAMILY: &'static str = "family";
    pub const KIND: &'static str = "kind";
    pub const RESULT: &'static str = "result";
    pub const TABLE: &'static str = "table";
}

/// Outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultLabel {
    Success,
    Failure,
    Cancelled,
    Panicked,
}

impl ResultLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultLabel::Success => "success",
            ResultLabel::Failure => "failure",
            ResultLabel::Cancelled => "cancelled",
            ResultLabel::Panicked => "panicked",
        }
    }
}

impl fmt::Display for ResultLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-pair label set
pub(crate) fn label(name: &str, value: impl fmt::Display) -> Vec<(String, String)> {
    vec![(name.to_string(), value.to_string())]
}
