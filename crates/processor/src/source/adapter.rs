//! Normalization of heterogeneous input records
//!
//! Records arrive as loosely typed field maps (a JSON object or a CSV row).
//! [`EventSourceAdapter::normalize`] resolves field aliases, parses the
//! timestamp in any of the accepted formats and produces a typed [`Event`],
//! or a [`MalformedRecordError`] that the caller counts and skips.

use crate::core::{Event, EventKind, EventPayload, MentionPayload, SalePayload, StreamKind};
use crate::error::MalformedRecordError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "date", "ts", "time"];
const SKU_FIELDS: &[&str] = &["sku", "item"];
const QUANTITY_FIELDS: &[&str] = &["quantity", "qty"];
const PRICE_FIELDS: &[&str] = &["price"];
const STORE_FIELDS: &[&str] = &["store_id", "store"];
const TEXT_FIELDS: &[&str] = &["text"];
const PLATFORM_FIELDS: &[&str] = &["platform"];

/// Untyped record as delivered by a feed
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub stream: StreamKind,
    /// Source position, when the feed tracks one
    pub offset: Option<u64>,
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(stream: StreamKind, fields: Map<String, Value>) -> Self {
        Self {
            stream,
            offset: None,
            fields,
        }
    }

    /// Parse a JSON object
    pub fn from_json(stream: StreamKind, json: &str) -> Result<Self, MalformedRecordError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| MalformedRecordError::InvalidJson(e.to_string()))?;
        Self::from_value(stream, value)
    }

    pub fn from_value(stream: StreamKind, value: Value) -> Result<Self, MalformedRecordError> {
        match value {
            Value::Object(fields) => Ok(Self::new(stream, fields)),
            _ => Err(MalformedRecordError::NotAnObject),
        }
    }

    /// Build from string pairs, as produced by a CSV header and row
    pub fn from_pairs<'a, I>(stream: StreamKind, pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), Value::String(v.to_string())))
            .collect();
        Self::new(stream, fields)
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn field(&self, aliases: &[&str]) -> Option<&Value> {
        aliases
            .iter()
            .filter_map(|name| self.fields.get(*name))
            .find(|value| !is_blank(value))
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Converts raw records into typed events
///
/// Assigns a per-stream sequence number to records that carry no offset, so
/// replays of the same feed produce the same offsets.
#[derive(Debug, Default)]
pub struct EventSourceAdapter {
    sales_offset: AtomicU64,
    mentions_offset: AtomicU64,
}

impl EventSourceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a raw record into an [`Event`]
    pub fn normalize(&self, raw: &RawRecord) -> Result<Event, MalformedRecordError> {
        let event_time = parse_timestamp(
            raw.field(TIMESTAMP_FIELDS)
                .ok_or(MalformedRecordError::MissingField { field: "timestamp" })?,
        )?;

        let (partition_key, payload) = match raw.stream {
            StreamKind::Sales => {
                let sku = required_string(raw, SKU_FIELDS, "sku")?;
                let quantity = required_number(raw, QUANTITY_FIELDS, "quantity")?;
                let price = match raw.field(PRICE_FIELDS) {
                    Some(value) => parse_number(value, "price")?,
                    None => 0.0,
                };
                let store_id = raw
                    .field(STORE_FIELDS)
                    .map(value_to_string)
                    .unwrap_or_default();
                (
                    sku,
                    EventPayload::Sale(SalePayload {
                        quantity,
                        price,
                        store_id,
                    }),
                )
            }
            StreamKind::Mentions => {
                let text = required_string(raw, TEXT_FIELDS, "text")?;
                let platform = required_string(raw, PLATFORM_FIELDS, "platform")?;
                (platform.clone(), EventPayload::Mention(MentionPayload { text, platform }))
            }
        };

        let offset = raw.offset.unwrap_or_else(|| self.next_offset(raw.stream));

        trace!(
            stream = %raw.stream,
            partition_key = %partition_key,
            event_time = %event_time,
            offset,
            "Normalized record"
        );

        Ok(Event {
            event_time,
            partition_key,
            kind: match raw.stream {
                StreamKind::Sales => EventKind::Sale,
                StreamKind::Mentions => EventKind::Mention,
            },
            payload,
            offset,
        })
    }

    fn next_offset(&self, stream: StreamKind) -> u64 {
        let counter = match stream {
            StreamKind::Sales => &self.sales_offset,
            StreamKind::Mentions => &self.mentions_offset,
        };
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

fn required_string(
    raw: &RawRecord,
    aliases: &[&str],
    field: &'static str,
) -> Result<String, MalformedRecordError> {
    raw.field(aliases)
        .map(value_to_string)
        .ok_or(MalformedRecordError::MissingField { field })
}

fn required_number(
    raw: &RawRecord,
    aliases: &[&str],
    field: &'static str,
) -> Result<f64, MalformedRecordError> {
    let value = raw
        .field(aliases)
        .ok_or(MalformedRecordError::MissingField { field })?;
    parse_number(value, field)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn parse_number(value: &Value, field: &'static str) -> Result<f64, MalformedRecordError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|n| n.is_finite())
        .ok_or_else(|| MalformedRecordError::InvalidNumber {
            field,
            value: value_to_string(value),
        })
}

/// Parse a timestamp field
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS`,
/// `YYYY-MM-DD`, epoch seconds (number or numeric string), and the tweet
/// form `Mon Apr 06 22:19:45 PDT 2009`. Naive values are read as UTC; the
/// zone abbreviation of the tweet form is ignored.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, MalformedRecordError> {
    let invalid = || MalformedRecordError::InvalidTimestamp {
        value: value_to_string(value),
    };

    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch_seconds).ok_or_else(invalid),
        Value::String(s) => parse_timestamp_str(s.trim()).ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }

    if let Ok(seconds) = s.parse::<f64>() {
        return from_epoch_seconds(seconds);
    }

    // "Mon Apr 06 22:19:45 PDT 2009"
    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() == 6 && parts[4].chars().all(|c| c.is_ascii_alphabetic()) {
        let without_zone = format!(
            "{} {} {} {} {}",
            parts[0], parts[1], parts[2], parts[3], parts[5]
        );
        if let Ok(naive) = NaiveDateTime::parse_from_str(&without_zone, "%a %b %d %H:%M:%S %Y") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    None
}

fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let millis = (seconds * 1000.0).round();
    if millis.abs() > i64::MAX as f64 {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}
