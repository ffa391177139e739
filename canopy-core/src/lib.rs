//! # canopy-core: shared data model for Canopy documents
//!
//! Value types only: handles to documents and records, channel naming, and
//! the messages that travel on document channels. No I/O lives here.
//!
//! ```text
//! DocumentRef ──► ChannelId (/doc/{id}/presence | activity | records/{c})
//!      │                         │
//!      ▼                         ▼
//! RecordRef (doc, collection, record)   ChannelMessage::{Presence, Activity, RecordChange}
//! ```

pub mod channel;
pub mod document;
pub mod message;

pub use channel::{ChannelId, ChannelKind};
pub use document::{DocumentRef, RecordRef};
pub use message::{
    ActivityEvent, ChannelMessage, PresenceEvent, PresenceKind, RecordChange, RecordOp,
};

use thiserror::Error;

/// Malformed identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefError {
    #[error("malformed record reference: {0}")]
    Malformed(String),
    #[error("invalid document id: {0}")]
    InvalidDocument(String),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// A channel payload that does not match its channel's decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload decode failed: {0}")]
    Json(String),
    #[error("record change for collection {found} on channel for {expected}")]
    CollectionMismatch { expected: String, found: String },
}
