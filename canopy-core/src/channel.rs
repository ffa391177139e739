//! Channel naming.
//!
//! ```text
//! /doc/{documentId}/presence
//! /doc/{documentId}/activity
//! /doc/{documentId}/records/{collectionId}
//! ```
//!
//! Presence and activity channels are document-scoped; record channels are
//! collection-scoped within a document.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::document::valid_segment;
use crate::RefError;

/// What a channel carries. Doubles as the decoder selector for payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Presence,
    Activity,
    Records { collection: String },
}

/// A validated, document-scoped channel path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    path: String,
    document: Uuid,
    kind: ChannelKind,
}

impl ChannelId {
    pub fn presence(document: Uuid) -> Self {
        Self {
            path: format!("/doc/{document}/presence"),
            document,
            kind: ChannelKind::Presence,
        }
    }

    pub fn activity(document: Uuid) -> Self {
        Self {
            path: format!("/doc/{document}/activity"),
            document,
            kind: ChannelKind::Activity,
        }
    }

    pub fn records(document: Uuid, collection: &str) -> Self {
        Self {
            path: format!("/doc/{document}/records/{collection}"),
            document,
            kind: ChannelKind::Records {
                collection: collection.to_string(),
            },
        }
    }

    /// Classify a wire path. Meta channels and unknown shapes are rejected.
    pub fn parse(path: &str) -> Result<Self, RefError> {
        let unknown = || RefError::UnknownChannel(path.to_string());
        let rest = path.strip_prefix("/doc/").ok_or_else(unknown)?;
        let mut parts = rest.split('/');
        let document = parts
            .next()
            .and_then(|d| Uuid::parse_str(d).ok())
            .filter(|d| !d.is_nil())
            .ok_or_else(unknown)?;

        let channel = match (parts.next(), parts.next(), parts.next()) {
            (Some("presence"), None, None) => Self::presence(document),
            (Some("activity"), None, None) => Self::activity(document),
            (Some("records"), Some(collection), None) if valid_segment(collection) => {
                Self::records(document, collection)
            }
            _ => return Err(unknown()),
        };
        Ok(channel)
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn document(&self) -> Uuid {
        self.document
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    /// The collection for record channels.
    pub fn collection(&self) -> Option<&str> {
        match &self.kind {
            ChannelKind::Records { collection } => Some(collection),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.path)
    }
}

impl FromStr for ChannelId {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        Self::parse(&path).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_channels() {
        let doc = Uuid::new_v4();
        let presence = ChannelId::parse(&format!("/doc/{doc}/presence")).unwrap();
        assert_eq!(presence.kind(), &ChannelKind::Presence);
        assert_eq!(presence.document(), doc);

        let records = ChannelId::parse(&format!("/doc/{doc}/records/shapes")).unwrap();
        assert_eq!(records.collection(), Some("shapes"));
        assert_eq!(records, ChannelId::records(doc, "shapes"));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let doc = Uuid::new_v4();
        for path in [
            "/meta/handshake".to_string(),
            format!("/doc/{doc}"),
            format!("/doc/{doc}/cursor"),
            format!("/doc/{doc}/records"),
            format!("/doc/{doc}/records/a/b"),
            format!("/doc/{}/presence", Uuid::nil()),
            "/doc/not-a-uuid/presence".to_string(),
        ] {
            assert!(ChannelId::parse(&path).is_err(), "{path} should be rejected");
        }
    }

    #[test]
    fn test_serde_as_string() {
        let ch = ChannelId::activity(Uuid::new_v4());
        let json = serde_json::to_string(&ch).unwrap();
        assert_eq!(json, format!("\"{}\"", ch.as_str()));
        let back: ChannelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ch);
        assert!(serde_json::from_str::<ChannelId>("\"/meta/connect\"").is_err());
    }
}
