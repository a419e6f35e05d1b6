//! Mention text buffered per sentiment window

use crate::window::{WindowAccumulator, WindowRef};
use serde::{Deserialize, Serialize};

/// Partition key shared by every mention
///
/// Sentiment is counted per label across all platforms, so the whole
/// mentions stream falls into one window partition.
pub const ALL_MENTIONS: &str = "all";

/// Texts admitted into one sentiment window, classified when it closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionBuffer {
    pub window_ref: WindowRef,
    pub texts: Vec<String>,
}

impl MentionBuffer {
    pub fn push(&mut self, text: impl Into<String>) -> usize {
        self.texts.push(text.into());
        self.texts.len()
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

impl WindowAccumulator for MentionBuffer {
    fn create(window_ref: &WindowRef) -> Self {
        Self {
            window_ref: window_ref.clone(),
            texts: Vec::new(),
        }
    }
}
