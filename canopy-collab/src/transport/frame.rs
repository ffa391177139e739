//! Bayeux-style wire frames.
//!
//! Every WebSocket text message carries a JSON array of frames. Requests on
//! meta channels are correlated with their replies by `id`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TransportError;

pub const HANDSHAKE: &str = "/meta/handshake";
pub const CONNECT: &str = "/meta/connect";
pub const SUBSCRIBE: &str = "/meta/subscribe";
pub const UNSUBSCRIBE: &str = "/meta/unsubscribe";
pub const DISCONNECT: &str = "/meta/disconnect";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Value>,
}

impl Frame {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    pub fn handshake(id: String, credential: &str, ack: bool) -> Self {
        Self {
            id: Some(id),
            ext: Some(json!({ "auth": { "token": credential }, "ack": ack })),
            ..Self::new(HANDSHAKE)
        }
    }

    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Extension value `ext.<key>`.
    pub fn ext_value(&self, key: &str) -> Option<&Value> {
        self.ext.as_ref().and_then(|ext| ext.get(key))
    }

    /// `advice.reconnect`, which is `"handshake"` when the server wants a
    /// fresh session instead of a resumed one.
    pub fn reconnect_advice(&self) -> Option<&str> {
        self.advice
            .as_ref()
            .and_then(|advice| advice.get("reconnect"))
            .and_then(Value::as_str)
    }

    /// Bayeux error strings look like `"401::Unauthorized"`.
    pub fn is_unauthorized(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|error| error.starts_with("401"))
    }

    pub fn error_or(&self, fallback: &str) -> String {
        self.error.clone().unwrap_or_else(|| fallback.to_string())
    }
}

pub fn encode(frames: &[Frame]) -> Result<String, TransportError> {
    serde_json::to_string(frames).map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Accepts an array of frames or a single bare frame.
pub fn decode(text: &str) -> Result<Vec<Frame>, TransportError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))?;
    let frames = if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|frame| vec![frame])
    };
    frames.map_err(|e| TransportError::Protocol(e.to_string()))
}
