//! Per-key trigger state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the downstream work for one key
///
/// ```text
/// IDLE ──request──> PENDING ──dispatch──> RUNNING ──done──> IDLE
///                      ^                     │
///                      └─failed / rerun──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    #[default]
    Idle,
    Pending,
    Running,
}

impl TriggerState {
    pub fn can_transition_to(&self, to: TriggerState) -> bool {
        matches!(
            (self, to),
            (TriggerState::Idle, TriggerState::Pending)
                | (TriggerState::Pending, TriggerState::Running)
                | (TriggerState::Running, TriggerState::Idle)
                | (TriggerState::Running, TriggerState::Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Idle => "IDLE",
            TriggerState::Pending => "PENDING",
            TriggerState::Running => "RUNNING",
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which downstream computation a trigger runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Forecast,
    Sentiment,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Forecast => "forecast",
            TriggerKind::Sentiment => "sentiment",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of mutual exclusion: one computation kind for one partition key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub kind: TriggerKind,
    pub partition_key: String,
}

impl TriggerKey {
    pub fn new(kind: TriggerKind, partition_key: impl Into<String>) -> Self {
        Self {
            kind,
            partition_key: partition_key.into(),
        }
    }

    pub fn forecast(partition_key: impl Into<String>) -> Self {
        Self::new(TriggerKind::Forecast, partition_key)
    }

    pub fn sentiment(partition_key: impl Into<String>) -> Self {
        Self::new(TriggerKind::Sentiment, partition_key)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.partition_key)
    }
}

/// Bookkeeping for one key
#[derive(Debug, Clone, Default)]
pub(crate) struct TriggerSlot {
    pub state: TriggerState,
    /// A request arrived while running
    pub rerun_requested: bool,
    /// Drain epoch in which the last invocation failed
    pub failed_epoch: Option<u64>,
    pub runs: u64,
    pub failures: u64,
}

impl TriggerSlot {
    /// Move to `to`, returning false for an illegal transition
    pub fn transition(&mut self, to: TriggerState) -> bool {
        if self.state.can_transition_to(to) {
            self.state = to;
            true
        } else {
            false
        }
    }
}

/// Number of keys in each state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCounts {
    pub idle: usize,
    pub pending: usize,
    pub running: usize,
}
