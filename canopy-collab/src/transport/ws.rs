//! WebSocket transport speaking Bayeux-style JSON frames.
//!
//! One writer task drains an outgoing queue into the socket; one reader task
//! routes replies to pending requests and channel messages to the
//! connection's event stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canopy_core::ChannelId;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::frame::{self, Frame, CONNECT, DISCONNECT, HANDSHAKE, SUBSCRIBE, UNSUBSCRIBE};
use super::{ConnectRequest, Connection, Extension, SessionInfo, Transport, TransportEvent};
use crate::broadcast::lock;
use crate::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>;

struct Link {
    client_id: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl Link {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let text = frame::encode(&[frame])?;
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(self, say_goodbye: bool) {
        if say_goodbye {
            let goodbye = Frame {
                client_id: Some(self.client_id.clone()),
                ..Frame::new(DISCONNECT)
            };
            let _ = self.send(goodbye);
        }
        let _ = self.outgoing.send(Message::Close(None));
        self.reader.abort();
        lock(&self.pending).clear();
    }
}

pub struct WsTransport {
    link: Mutex<Option<Link>>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    pub fn new() -> Self {
        Self::with_request_timeout(REQUEST_TIMEOUT)
    }

    /// `timeout` bounds every subscribe, unsubscribe and publish round trip.
    pub fn with_request_timeout(timeout: Duration) -> Self {
        Self {
            link: Mutex::new(None),
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout: timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.link).is_some()
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn request(&self, mut frame: Frame) -> Result<Frame, TransportError> {
        let id = self.next_id();
        let channel = frame.channel.clone();
        let (rx, pending) = {
            let guard = lock(&self.link);
            let link = guard.as_ref().ok_or(TransportError::Closed)?;
            frame.id = Some(id.clone());
            frame.client_id = Some(link.client_id.clone());
            let (tx, rx) = oneshot::channel();
            lock(&link.pending).insert(id.clone(), tx);
            if let Err(e) = link.send(frame) {
                lock(&link.pending).remove(&id);
                return Err(e);
            }
            (rx, link.pending.clone())
        };

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                lock(&pending).remove(&id);
                Err(TransportError::Protocol(format!(
                    "no reply on {channel} within {:?}",
                    self.request_timeout
                )))
            }
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(link) = lock(&self.link).take() {
            link.close(false);
        }
    }
}

fn expect_success(channel: &ChannelId, reply: Frame) -> Result<(), TransportError> {
    if reply.is_successful() {
        Ok(())
    } else {
        Err(TransportError::Rejected {
            channel: channel.to_string(),
            reason: reply.error_or("refused by server"),
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        if let Some(old) = lock(&self.link).take() {
            old.close(true);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let wants_ack = request.wants(Extension::Ack);
        let handshake = Frame::handshake(self.next_id(), &request.credential, wants_ack);
        sink.send(Message::Text(frame::encode(&[handshake])?.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let reply = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    let found = frame::decode(text.as_str())?
                        .into_iter()
                        .find(|f| f.channel == HANDSHAKE);
                    if let Some(reply) = found {
                        break reply;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            }
        };

        if !reply.is_successful() {
            let reason = reply.error_or("handshake refused");
            return Err(if reply.is_unauthorized() {
                TransportError::Unauthorized(reason)
            } else {
                TransportError::Connect(reason)
            });
        }
        let client_id = reply.client_id.clone().ok_or_else(|| {
            TransportError::Protocol("handshake reply without clientId".to_string())
        })?;
        let ack = wants_ack && reply.ext_value("ack").and_then(Value::as_bool).unwrap_or(false);

        // Writer task: forward the outgoing queue to the socket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: Pending = Arc::default();
        let reader = tokio::spawn(read_loop(
            source,
            ReaderCtx {
                events: events_tx,
                pending: pending.clone(),
                outgoing: out_tx.clone(),
                client_id: client_id.clone(),
                ack,
                ids: self.next_id.clone(),
            },
        ));

        log::info!("handshake complete, client id {client_id} (ack: {ack})");
        *lock(&self.link) = Some(Link {
            client_id: client_id.clone(),
            outgoing: out_tx,
            pending,
            reader,
        });

        Ok(Connection {
            info: SessionInfo { client_id, ack },
            events: events_rx,
        })
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let reply = self
            .request(Frame {
                subscription: Some(channel.as_str().to_string()),
                ..Frame::new(SUBSCRIBE)
            })
            .await?;
        expect_success(channel, reply)
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let reply = self
            .request(Frame {
                subscription: Some(channel.as_str().to_string()),
                ..Frame::new(UNSUBSCRIBE)
            })
            .await?;
        expect_success(channel, reply)
    }

    async fn publish(&self, channel: &ChannelId, data: Value) -> Result<(), TransportError> {
        let reply = self
            .request(Frame {
                data: Some(data),
                ..Frame::new(channel.as_str())
            })
            .await?;
        expect_success(channel, reply)
    }

    async fn disconnect(&self) {
        if let Some(link) = lock(&self.link).take() {
            log::info!("disconnecting client {}", link.client_id);
            link.close(true);
        }
    }
}

struct ReaderCtx {
    events: mpsc::Sender<TransportEvent>,
    pending: Pending,
    outgoing: mpsc::UnboundedSender<Message>,
    client_id: String,
    ack: bool,
    ids: Arc<AtomicU64>,
}

impl ReaderCtx {
    /// Echo the server's batch id so it can release acknowledged messages.
    fn acknowledge(&self, batch: &Value) {
        let frame = Frame {
            id: Some(self.ids.fetch_add(1, Ordering::Relaxed).to_string()),
            client_id: Some(self.client_id.clone()),
            ext: Some(json!({ "ack": batch })),
            ..Frame::new(CONNECT)
        };
        if let Ok(text) = frame::encode(&[frame]) {
            let _ = self.outgoing.send(Message::Text(text.into()));
        }
    }

    /// Turn one inbound frame into a connection event, if it is one.
    fn route(&self, frame: Frame) -> Option<TransportEvent> {
        // Publish replies come back on the data channel, flagged `successful`.
        let is_reply = frame.is_meta() || frame.successful.is_some();
        if is_reply {
            if let Some(id) = frame.id.as_deref() {
                let waiter = lock(&self.pending).remove(id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(frame);
                    return None;
                }
            }
            if !frame.is_meta() {
                log::debug!("dropping late reply on {}", frame.channel);
                return None;
            }
            let rejected = (frame.channel == CONNECT && frame.is_unauthorized())
                || (frame.channel == DISCONNECT && frame.reconnect_advice() == Some("handshake"));
            if rejected {
                return Some(TransportEvent::AuthRejected {
                    reason: frame.error_or("session credential rejected"),
                });
            }
            log::debug!("ignoring unsolicited {} frame", frame.channel);
            return None;
        }

        let channel = match ChannelId::parse(&frame.channel) {
            Ok(channel) => channel,
            Err(e) => {
                log::debug!("dropping message on unrecognized channel: {e}");
                return None;
            }
        };
        if self.ack {
            if let Some(batch) = frame.ext_value("ack") {
                self.acknowledge(batch);
            }
        }
        Some(TransportEvent::Message {
            channel,
            data: frame.data.unwrap_or(Value::Null),
        })
    }
}

async fn read_loop<S>(mut source: S, ctx: ReaderCtx)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = 'read: loop {
        let text = match source.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(close))) => {
                break close
                    .map(|c| c.reason.as_str().to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by server".to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        };

        let frames = match frame::decode(text.as_str()) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!("dropping undecodable batch: {e}");
                continue;
            }
        };
        for frame in frames {
            if let Some(event) = ctx.route(frame) {
                if ctx.events.send(event).await.is_err() {
                    break 'read "event stream dropped".to_string();
                }
            }
        }
    };

    log::info!("connection for {} ended: {reason}", ctx.client_id);
    lock(&ctx.pending).clear();
    let _ = ctx.events.send(TransportEvent::Disconnected { reason }).await;
}
