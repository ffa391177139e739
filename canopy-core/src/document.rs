//! Document and record handles.
//!
//! A [`DocumentRef`] or [`RecordRef`] identifies shared state; it never holds
//! the state itself. The referenced payloads live in the record cache keyed
//! by `(document, collection, record)`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::ChannelId;
use crate::RefError;

/// Longest collection or record identifier accepted by [`RecordRef::is_valid`].
pub const MAX_SEGMENT_LEN: usize = 128;

/// Handle to a shared canvas document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: Uuid,
}

impl DocumentRef {
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }

    /// A fresh document id (for local drafts and tests).
    pub fn random() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
    }

    /// Channel carrying join/leave/custom presence signals.
    pub fn presence_channel(&self) -> ChannelId {
        ChannelId::presence(self.id)
    }

    /// Channel carrying user-visible activity log entries.
    pub fn activity_channel(&self) -> ChannelId {
        ChannelId::activity(self.id)
    }

    /// Channel carrying record changes for one collection.
    pub fn records_channel(&self, collection: &str) -> ChannelId {
        ChannelId::records(self.id, collection)
    }

    /// Handle to a record in `collection` of this document.
    pub fn record(&self, collection: impl Into<String>, record: impl Into<String>) -> RecordRef {
        RecordRef {
            document: self.id,
            collection: collection.into(),
            record: record.into(),
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Handle to a single record within a named collection of a document.
///
/// Construction is infallible; callers check [`RecordRef::is_valid`] before
/// use. An invalid ref means the identifier was malformed or the record
/// could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub document: Uuid,
    pub collection: String,
    pub record: String,
}

impl RecordRef {
    pub fn document(&self) -> DocumentRef {
        DocumentRef::new(self.document)
    }

    /// Structural validity check.
    pub fn is_valid(&self) -> bool {
        !self.document.is_nil() && valid_segment(&self.collection) && valid_segment(&self.record)
    }

    /// Parse the `<document>/<collection>/<record>` form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self, RefError> {
        let mut parts = s.splitn(3, '/');
        let (Some(doc), Some(collection), Some(record)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(RefError::Malformed(s.to_string()));
        };
        let document = Uuid::parse_str(doc).map_err(|_| RefError::InvalidDocument(doc.to_string()))?;
        let reference = Self {
            document,
            collection: collection.to_string(),
            record: record.to_string(),
        };
        if !reference.is_valid() {
            return Err(RefError::Malformed(s.to_string()));
        }
        Ok(reference)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.document, self.collection, self.record)
    }
}

/// Collection and record ids share the same rules.
pub fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LEN
        && !segment.chars().any(|c| c == '/' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_ref_validity() {
        let doc = DocumentRef::random();
        assert!(doc.record("shapes", "shape-1").is_valid());
        assert!(!doc.record("", "shape-1").is_valid());
        assert!(!doc.record("shapes", "").is_valid());
        assert!(!doc.record("shapes", "a/b").is_valid());
        assert!(!doc.record("sha pes", "x").is_valid());
        assert!(!doc.record("shapes", "x".repeat(MAX_SEGMENT_LEN + 1)).is_valid());
        assert!(!DocumentRef::new(Uuid::nil()).record("shapes", "x").is_valid());
    }

    #[test]
    fn test_record_ref_parse_display() {
        let doc = DocumentRef::random();
        let r = doc.record("shapes", "shape-1");
        let parsed = RecordRef::parse(&r.to_string()).unwrap();
        assert_eq!(parsed, r);
        assert_eq!(parsed.document(), doc);
    }

    #[test]
    fn test_record_ref_parse_errors() {
        assert!(matches!(RecordRef::parse("nope"), Err(RefError::Malformed(_))));
        assert!(matches!(
            RecordRef::parse("not-a-uuid/shapes/x"),
            Err(RefError::InvalidDocument(_))
        ));
        let doc = DocumentRef::random();
        // Trailing separator puts a slash into the record id.
        assert!(RecordRef::parse(&format!("{doc}/shapes/a/b")).is_err());
    }

    #[test]
    fn test_document_channels() {
        let doc = DocumentRef::random();
        assert_eq!(doc.presence_channel().as_str(), format!("/doc/{}/presence", doc.id));
        assert_eq!(doc.activity_channel().as_str(), format!("/doc/{}/activity", doc.id));
        assert_eq!(
            doc.records_channel("shapes").as_str(),
            format!("/doc/{}/records/shapes", doc.id)
        );
    }
}
