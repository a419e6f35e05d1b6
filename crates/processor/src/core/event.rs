//! Typed event envelope
//!
//! Every input record, whatever feed it came from, is normalized into an
//! [`Event`] before it reaches the window managers. Events are immutable once
//! created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Input feed an event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Per-transaction sales records
    Sales,
    /// Free-text review and social mentions
    Mentions,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Sales => "sales",
            StreamKind::Mentions => "mentions",
        }
    }

    /// Event kind carried by this feed
    pub fn event_kind(&self) -> EventKind {
        match self {
            StreamKind::Sales => EventKind::Sale,
            StreamKind::Mentions => EventKind::Mention,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Sale,
    Mention,
}

/// Payload of a sale event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePayload {
    pub quantity: f64,
    pub price: f64,
    pub store_id: String,
}

/// Payload of a mention event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionPayload {
    pub text: String,
    pub platform: String,
}

/// Kind-specific event data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Sale(SalePayload),
    Mention(MentionPayload),
}

/// Uniform event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event happened at the source
    pub event_time: DateTime<Utc>,
    /// Grouping key: SKU for sales, platform for mentions
    pub partition_key: String,
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Position of the record in its source feed
    pub offset: u64,
}

impl Event {
    /// Build a sale event
    pub fn sale(
        event_time: DateTime<Utc>,
        sku: impl Into<String>,
        quantity: f64,
        price: f64,
        store_id: impl Into<String>,
    ) -> Self {
        Self {
            event_time,
            partition_key: sku.into(),
            kind: EventKind::Sale,
            payload: EventPayload::Sale(SalePayload {
                quantity,
                price,
                store_id: store_id.into(),
            }),
            offset: 0,
        }
    }

    /// Build a mention event keyed by its platform
    pub fn mention(
        event_time: DateTime<Utc>,
        text: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        let platform = platform.into();
        Self {
            event_time,
            partition_key: platform.clone(),
            kind: EventKind::Mention,
            payload: EventPayload::Mention(MentionPayload {
                text: text.into(),
                platform,
            }),
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Feed this event belongs to
    pub fn stream(&self) -> StreamKind {
        match self.kind {
            EventKind::Sale => StreamKind::Sales,
            EventKind::Mention => StreamKind::Mentions,
        }
    }

    /// Sold quantity, for sale events
    pub fn quantity(&self) -> Option<f64> {
        match &self.payload {
            EventPayload::Sale(sale) => Some(sale.quantity),
            EventPayload::Mention(_) => None,
        }
    }

    /// Store id, for sale events
    pub fn store_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Sale(sale) => Some(sale.store_id.as_str()),
            EventPayload::Mention(_) => None,
        }
    }

    /// Mention text, for mention events
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Mention(mention) => Some(mention.text.as_str()),
            EventPayload::Sale(_) => None,
        }
    }
}
