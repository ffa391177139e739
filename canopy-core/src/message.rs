//! Channel payloads.
//!
//! Every data frame on a document channel decodes into one
//! [`ChannelMessage`]. The channel's [`ChannelKind`] selects the decoder, so
//! the same JSON shape is never ambiguous across channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::ChannelKind;
use crate::DecodeError;

/// What a presence signal says about a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PresenceKind {
    Arrived,
    Departed,
    Custom,
    /// Anything this client does not understand. Kept, not rejected.
    Unknown,
}

impl From<String> for PresenceKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "arrived" => Self::Arrived,
            "departed" => Self::Departed,
            "custom" => Self::Custom,
            _ => Self::Unknown,
        }
    }
}

impl From<PresenceKind> for String {
    fn from(kind: PresenceKind) -> Self {
        match kind {
            PresenceKind::Arrived => "arrived",
            PresenceKind::Departed => "departed",
            PresenceKind::Custom => "custom",
            PresenceKind::Unknown => "unknown",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub kind: PresenceKind,
    /// Signal name for `Custom` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl PresenceEvent {
    pub fn arrived(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: PresenceKind::Arrived,
            signal: None,
            data: None,
        }
    }

    pub fn departed(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: PresenceKind::Departed,
            signal: None,
            data: None,
        }
    }

    pub fn custom(user_id: impl Into<String>, signal: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: PresenceKind::Custom,
            signal: Some(signal.into()),
            data,
        }
    }
}

/// A logged, user-visible action on a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub event_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOp {
    Set,
    Delete,
}

/// A server-side change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChange {
    /// Filled from the channel when the frame omits it.
    #[serde(default)]
    pub collection: String,
    pub record: String,
    pub op: RecordOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub revision: u64,
}

impl RecordChange {
    pub fn set(collection: impl Into<String>, record: impl Into<String>, payload: Value, revision: u64) -> Self {
        Self {
            collection: collection.into(),
            record: record.into(),
            op: RecordOp::Set,
            payload: Some(payload),
            revision,
        }
    }

    pub fn delete(collection: impl Into<String>, record: impl Into<String>, revision: u64) -> Self {
        Self {
            collection: collection.into(),
            record: record.into(),
            op: RecordOp::Delete,
            payload: None,
            revision,
        }
    }
}

/// Everything that can arrive on a document channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Presence(PresenceEvent),
    Activity(ActivityEvent),
    RecordChange(RecordChange),
}

impl ChannelMessage {
    /// Decode a raw channel payload with the decoder for `kind`.
    ///
    /// The `type` tag is optional on the wire; the channel decides.
    pub fn decode(kind: &ChannelKind, data: &Value) -> Result<Self, DecodeError> {
        let json = |e: serde_json::Error| DecodeError::Json(e.to_string());
        match kind {
            ChannelKind::Presence => PresenceEvent::deserialize(data)
                .map(Self::Presence)
                .map_err(json),
            ChannelKind::Activity => ActivityEvent::deserialize(data)
                .map(Self::Activity)
                .map_err(json),
            ChannelKind::Records { collection } => {
                let mut change = RecordChange::deserialize(data).map_err(json)?;
                if change.collection.is_empty() {
                    change.collection = collection.clone();
                } else if &change.collection != collection {
                    return Err(DecodeError::CollectionMismatch {
                        expected: collection.clone(),
                        found: change.collection,
                    });
                }
                Ok(Self::RecordChange(change))
            }
        }
    }

    /// Payload form published on the wire (the inner object, untagged).
    pub fn to_payload(&self) -> Value {
        let inner = match self {
            Self::Presence(e) => serde_json::to_value(e),
            Self::Activity(e) => serde_json::to_value(e),
            Self::RecordChange(e) => serde_json::to_value(e),
        };
        inner.unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_presence_unknown_kind() {
        let msg = ChannelMessage::decode(
            &ChannelKind::Presence,
            &json!({"user_id": "u1", "kind": "teleported"}),
        )
        .unwrap();
        match msg {
            ChannelMessage::Presence(p) => {
                assert_eq!(p.user_id, "u1");
                assert_eq!(p.kind, PresenceKind::Unknown);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_presence_custom_signal() {
        let msg = ChannelMessage::decode(
            &ChannelKind::Presence,
            &json!({"user_id": "u1", "kind": "custom", "signal": "cursor", "data": {"x": 4}}),
        )
        .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::Presence(PresenceEvent::custom("u1", "cursor", Some(json!({"x": 4}))))
        );
        let arrived = PresenceEvent::arrived("u2");
        assert!(arrived.signal.is_none() && arrived.data.is_none());
    }

    #[test]
    fn test_decode_record_fills_collection() {
        let kind = ChannelKind::Records {
            collection: "shapes".into(),
        };
        let msg = ChannelMessage::decode(
            &kind,
            &json!({"record": "shape-1", "op": "set", "payload": {"x": 5}, "revision": 3}),
        )
        .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::RecordChange(RecordChange::set("shapes", "shape-1", json!({"x": 5}), 3))
        );
    }

    #[test]
    fn test_decode_record_collection_mismatch() {
        let kind = ChannelKind::Records {
            collection: "shapes".into(),
        };
        let err = ChannelMessage::decode(
            &kind,
            &json!({"collection": "pages", "record": "p", "op": "delete", "revision": 1}),
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::CollectionMismatch { .. }));
    }

    #[test]
    fn test_decode_activity() {
        let msg = ChannelMessage::decode(
            &ChannelKind::Activity,
            &json!({
                "event_id": "e1",
                "message": "Alice added a shape",
                "created_at": "2026-01-02T03:04:05Z"
            }),
        )
        .unwrap();
        let ChannelMessage::Activity(event) = msg else {
            panic!("expected activity");
        };
        assert_eq!(event.message, "Alice added a shape");
        assert!(event.actor.is_none());
    }

    #[test]
    fn test_decode_wrong_shape_is_error() {
        assert!(ChannelMessage::decode(&ChannelKind::Activity, &json!({"user_id": "u"})).is_err());
    }

    #[test]
    fn test_payload_is_untagged() {
        let msg = ChannelMessage::Presence(PresenceEvent::custom("u1", "wave", None));
        let payload = msg.to_payload();
        assert!(payload.get("type").is_none());
        assert_eq!(payload["kind"], "custom");
        assert_eq!(ChannelMessage::decode(&ChannelKind::Presence, &payload).unwrap(), msg);
    }
}
