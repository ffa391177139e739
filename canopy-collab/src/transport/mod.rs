//! Transport boundary.
//!
//! A [`Transport`] is a long-poll/streaming pub-sub client: it opens an
//! authenticated session, subscribes channels, publishes payloads and reports
//! inbound messages and connection loss on a per-connection event stream.
//! The session manager is its only caller.

pub mod frame;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use canopy_core::ChannelId;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use ws::WsTransport;

/// Protocol extensions negotiated at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// Server-side message acknowledgement (at-least-once delivery across
    /// reconnects of the same session).
    Ack,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub credential: String,
    pub extensions: Vec<Extension>,
}

impl ConnectRequest {
    pub fn wants(&self, extension: Extension) -> bool {
        self.extensions.contains(&extension)
    }
}

/// What the server agreed to at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: String,
    pub ack: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { channel: ChannelId, data: Value },
    /// The connection is gone. The stream ends after this event.
    Disconnected { reason: String },
    /// The server no longer accepts the session credential.
    AuthRejected { reason: String },
}

/// One live connection. Dropping `events` does not close the socket.
pub struct Connection {
    pub info: SessionInfo,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError>;

    async fn subscribe(&self, channel: &ChannelId) -> Result<(), TransportError>;

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), TransportError>;

    async fn publish(&self, channel: &ChannelId, data: Value) -> Result<(), TransportError>;

    /// Close the current connection, if any.
    async fn disconnect(&self);
}

/// Produces the transport on first use, so nothing is set up for clients
/// that never go online.
#[async_trait]
pub trait TransportLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Loads a fresh [`WsTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WsLoader;

#[async_trait]
impl TransportLoader for WsLoader {
    async fn load(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(WsTransport::new()))
    }
}

/// Hands out an already constructed transport.
#[derive(Clone)]
pub struct Preloaded(pub Arc<dyn Transport>);

#[async_trait]
impl TransportLoader for Preloaded {
    async fn load(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(self.0.clone())
    }
}
