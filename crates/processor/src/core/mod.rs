//! Core event types shared by every component

pub mod event;

pub use event::{Event, EventKind, EventPayload, MentionPayload, SalePayload, StreamKind};
