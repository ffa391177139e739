//! Transport session manager.
//!
//! Owns the single connection to the pub-sub server. One driver task per
//! connection lifetime owns the transport event stream and a FIFO queue of
//! subscription operations:
//!
//! ```text
//!   ensure_connected() ──► Idle ─► Connecting ─► Connected ◄─┐
//!                                     │              │       │ resubscribe live
//!                                     ▼              ▼       │ emit Resynced
//!                             Idle (fatal)     Reconnecting ─┘
//! ```
//!
//! Callers mutate the desired channel set synchronously and enqueue an op.
//! The driver reconciles the desired set against what the server has, so
//! subscribe/unsubscribe pairs can never be reordered on the wire.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use canopy_core::ChannelId;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthService;
use crate::broadcast::{lock, Listeners, Subscription};
use crate::config::SessionConfig;
use crate::error::{
    PublishError, SessionError, SubscriptionError, TransportConnectError, TransportError,
};
use crate::transport::{
    ConnectRequest, Connection, Extension, SessionInfo, Transport, TransportEvent,
    TransportLoader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disposed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected { client_id: String },
    Disconnected { reason: String },
    /// Every live channel was re-subscribed after a reconnect. Emitted once
    /// per re-established connection.
    Resynced,
    /// The session could not be kept up. The manager is back to `Idle`.
    Fatal(SessionError),
    /// The server refused a channel while no caller was waiting on it.
    SubscriptionFailed {
        channel: ChannelId,
        error: TransportError,
    },
}

/// A payload received on a live channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: ChannelId,
    pub data: Value,
}

enum Op {
    Sync {
        channel: ChannelId,
        reply: Option<oneshot::Sender<Result<(), SubscriptionError>>>,
    },
    Publish {
        channel: ChannelId,
        data: Value,
        reply: oneshot::Sender<Result<(), PublishError>>,
    },
}

impl Op {
    fn fail(self, error: &SessionError) {
        match self {
            Op::Sync {
                reply: Some(reply), ..
            } => {
                let _ = reply.send(Err(error.clone().into()));
            }
            Op::Sync { reply: None, .. } => {}
            Op::Publish { reply, .. } => {
                let _ = reply.send(Err(error.clone().into()));
            }
        }
    }
}

struct Shared {
    url: String,
    config: SessionConfig,
    auth: AuthService,
    loader: Arc<dyn TransportLoader>,
    transport: OnceCell<Arc<dyn Transport>>,
    link: watch::Sender<LinkState>,
    last_error: Mutex<Option<SessionError>>,
    info: Mutex<Option<SessionInfo>>,
    ops: mpsc::UnboundedSender<Op>,
    /// Parked here while no driver is running.
    parked_ops: Mutex<Option<mpsc::UnboundedReceiver<Op>>>,
    live: Mutex<BTreeSet<ChannelId>>,
    ever_connected: AtomicBool,
    messages: Listeners<InboundMessage>,
    events: Listeners<SessionEvent>,
    cancel: CancellationToken,
}

impl Shared {
    /// Move to `next` unless disposed. Returns whether the state changed.
    fn set_link(&self, next: LinkState) -> bool {
        self.link.send_if_modified(|state| {
            if *state == LinkState::Disposed || *state == next {
                false
            } else {
                log::debug!("session {state:?} -> {next:?}");
                *state = next;
                true
            }
        })
    }

    fn is_live(&self, channel: &ChannelId) -> bool {
        lock(&self.live).contains(channel)
    }

    async fn transport(&self) -> Result<Arc<dyn Transport>, SessionError> {
        self.transport
            .get_or_try_init(|| async { self.loader.load().await })
            .await
            .cloned()
            .map_err(|e| TransportConnectError::Load(e.to_string()).into())
    }

    fn finish(&self, outcome: Result<(), SessionError>) {
        *lock(&self.info) = None;
        if let Err(error) = outcome {
            log::error!("session failed: {error}");
            *lock(&self.last_error) = Some(error.clone());
            if self.set_link(LinkState::Idle) {
                self.events.emit(&SessionEvent::Fatal(error));
            }
        }
    }
}

/// Handle to the shared session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    /// Nothing is loaded or connected until the first
    /// [`SessionManager::ensure_connected`].
    pub fn new(
        url: impl Into<String>,
        config: SessionConfig,
        auth: AuthService,
        loader: Arc<dyn TransportLoader>,
    ) -> Self {
        let (ops, parked) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                config,
                auth,
                loader,
                transport: OnceCell::new(),
                link: watch::channel(LinkState::Idle).0,
                last_error: Mutex::new(None),
                info: Mutex::new(None),
                ops,
                parked_ops: Mutex::new(Some(parked)),
                live: Mutex::new(BTreeSet::new()),
                ever_connected: AtomicBool::new(false),
                messages: Listeners::new(),
                events: Listeners::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.shared.link.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.link.subscribe()
    }

    /// The failure that last sent the session back to `Idle`.
    pub fn last_error(&self) -> Option<SessionError> {
        lock(&self.shared.last_error).clone()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        lock(&self.shared.info).clone()
    }

    pub fn live_channels(&self) -> Vec<ChannelId> {
        lock(&self.shared.live).iter().cloned().collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == LinkState::Disposed
    }

    /// Resolve once connected. Concurrent callers share one connect attempt
    /// and all observe its outcome.
    pub async fn ensure_connected(&self) -> Result<(), SessionError> {
        let mut rx = self.shared.link.subscribe();
        let start = self.shared.link.send_if_modified(|state| {
            if *state == LinkState::Idle {
                *state = LinkState::Connecting;
                true
            } else {
                false
            }
        });
        if start {
            *lock(&self.shared.last_error) = None;
            spawn_driver(self.shared.clone());
        }

        loop {
            let state = *rx.borrow_and_update();
            match state {
                LinkState::Connected => return Ok(()),
                LinkState::Disposed => return Err(SessionError::Disposed),
                LinkState::Idle => {
                    return Err(self.last_error().unwrap_or(SessionError::Disposed));
                }
                LinkState::Connecting | LinkState::Reconnecting => {
                    if rx.changed().await.is_err() {
                        return Err(SessionError::Disposed);
                    }
                }
            }
        }
    }

    /// Add `channel` to the live set. The set changes before this returns;
    /// the future resolves once the server confirmed the subscription.
    pub(crate) fn subscribe(
        &self,
        channel: ChannelId,
    ) -> impl Future<Output = Result<(), SubscriptionError>> + Send + 'static {
        let session = self.clone();
        let reply = if self.is_disposed() {
            None
        } else {
            lock(&self.shared.live).insert(channel.clone());
            let (tx, rx) = oneshot::channel();
            let _ = self.shared.ops.send(Op::Sync {
                channel,
                reply: Some(tx),
            });
            Some(rx)
        };

        async move {
            let Some(reply) = reply else {
                return Err(SessionError::Disposed.into());
            };
            session.ensure_connected().await?;
            reply
                .await
                .unwrap_or(Err(SubscriptionError::Session(SessionError::Disposed)))
        }
    }

    /// Remove `channel` from the live set. Never suspends.
    pub(crate) fn unsubscribe(&self, channel: &ChannelId) {
        if lock(&self.shared.live).remove(channel) {
            let _ = self.shared.ops.send(Op::Sync {
                channel: channel.clone(),
                reply: None,
            });
        }
    }

    pub async fn publish(&self, channel: &ChannelId, data: Value) -> Result<(), PublishError> {
        self.ensure_connected().await?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .ops
            .send(Op::Publish {
                channel: channel.clone(),
                data,
                reply: tx,
            })
            .map_err(|_| SessionError::Disposed)?;
        rx.await
            .unwrap_or(Err(PublishError::Session(SessionError::Disposed)))
    }

    /// Messages on live channels, in arrival order.
    pub fn on_message(
        &self,
        callback: impl Fn(&InboundMessage) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.messages.subscribe(callback)
    }

    pub fn on_session_event(
        &self,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.events.subscribe(callback)
    }

    /// Disconnect and silence all listeners. Idempotent.
    pub fn dispose(&self) {
        if self.shared.link.send_replace(LinkState::Disposed) == LinkState::Disposed {
            return;
        }
        log::info!("disposing session");
        self.shared.cancel.cancel();
        lock(&self.shared.live).clear();
        self.shared.messages.close();
        self.shared.events.close();
    }
}

fn spawn_driver(shared: Arc<Shared>) {
    tokio::spawn(async move {
        let parked = lock(&shared.parked_ops).take();
        let Some(mut ops) = parked else {
            log::error!("session driver started while another one is running");
            return;
        };

        let (outcome, deferred) = match shared.transport().await {
            Ok(transport) => {
                let mut driver = Driver {
                    shared: shared.clone(),
                    transport,
                    ops,
                    server: BTreeSet::new(),
                    deferred: Vec::new(),
                    retry: BTreeMap::new(),
                    retry_at: None,
                    retry_attempts: 0,
                    auth_failures: 0,
                };
                let outcome = driver.run().await;
                ops = driver.ops;
                (outcome, driver.deferred)
            }
            Err(error) => (Err(error), Vec::new()),
        };

        let error = match &outcome {
            Ok(()) => SessionError::Disposed,
            Err(error) => error.clone(),
        };
        for op in deferred {
            op.fail(&error);
        }
        while let Ok(op) = ops.try_recv() {
            op.fail(&error);
        }
        *lock(&shared.parked_ops) = Some(ops);
        shared.finish(outcome);
    });
}

enum Reconcile {
    Done,
    Rejected(TransportError),
    Transient(TransportError),
}

enum ConnectionEnd {
    Lost(String),
    Revoked(String),
}

enum Wake {
    Cancelled,
    Event(Option<TransportEvent>),
    Op(Option<Op>),
    Retry,
}

struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    ops: mpsc::UnboundedReceiver<Op>,
    /// Channels the server currently has for this connection.
    server: BTreeSet<ChannelId>,
    /// Ops waiting on a channel whose subscribe failed transiently.
    deferred: Vec<Op>,
    /// Live channels to subscribe again on this connection, with the last
    /// failure seen for each.
    retry: BTreeMap<ChannelId, TransportError>,
    retry_at: Option<Instant>,
    retry_attempts: u32,
    auth_failures: u32,
}

impl Driver {
    /// Returns `Ok` when disposed, `Err` when the session is lost for good.
    async fn run(&mut self) -> Result<(), SessionError> {
        let cancel = self.shared.cancel.clone();
        loop {
            let connection = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                connection = self.connect_with_retry() => connection?,
            };
            let Connection { info, mut events } = connection;

            self.server.clear();
            *lock(&self.shared.info) = Some(info.clone());
            if !self.shared.set_link(LinkState::Connected) {
                self.transport.disconnect().await;
                return Ok(());
            }
            log::info!("session connected as {}", info.client_id);
            self.shared.events.emit(&SessionEvent::Connected {
                client_id: info.client_id.clone(),
            });

            // The full reconcile below covers every channel awaiting a retry.
            self.retry.clear();
            self.retry_at = None;
            self.retry_attempts = 0;
            let mut batch = std::mem::take(&mut self.deferred);
            while let Ok(op) = self.ops.try_recv() {
                batch.push(op);
            }
            self.apply(batch, true).await;
            if self.shared.ever_connected.swap(true, Ordering::AcqRel) {
                log::info!("resynced {} channels", self.server.len());
                self.shared.events.emit(&SessionEvent::Resynced);
            }

            let end = loop {
                let retry_at = self.retry_at;
                let wake = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    event = events.recv() => Wake::Event(event),
                    _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                        if retry_at.is_some() => Wake::Retry,
                    op = self.ops.recv() => Wake::Op(op),
                };
                match wake {
                    Wake::Cancelled | Wake::Op(None) => {
                        self.transport.disconnect().await;
                        return Ok(());
                    }
                    Wake::Op(Some(op)) => self.apply(vec![op], false).await,
                    Wake::Retry => self.retry_transient().await,
                    Wake::Event(Some(TransportEvent::Message { channel, data })) => {
                        self.auth_failures = 0;
                        if self.shared.is_live(&channel) {
                            self.shared.messages.emit(&InboundMessage { channel, data });
                        } else {
                            log::debug!("dropping message on inactive channel {channel}");
                        }
                    }
                    Wake::Event(Some(TransportEvent::Disconnected { reason })) => {
                        break ConnectionEnd::Lost(reason)
                    }
                    Wake::Event(None) => break ConnectionEnd::Lost("event stream ended".into()),
                    Wake::Event(Some(TransportEvent::AuthRejected { reason })) => {
                        break ConnectionEnd::Revoked(reason)
                    }
                }
            };

            *lock(&self.shared.info) = None;
            let reason = match end {
                ConnectionEnd::Lost(reason) => {
                    log::warn!("connection lost: {reason}");
                    reason
                }
                ConnectionEnd::Revoked(reason) => {
                    log::warn!("server rejected session credential: {reason}");
                    self.transport.disconnect().await;
                    self.credential_rejected().await?;
                    reason
                }
            };
            if !self.shared.set_link(LinkState::Reconnecting) {
                return Ok(());
            }
            self.shared.events.emit(&SessionEvent::Disconnected { reason });
        }
    }

    /// Count a credential rejection and refresh the token, or give up.
    async fn credential_rejected(&mut self) -> Result<(), SessionError> {
        self.auth_failures += 1;
        if self.auth_failures > self.shared.config.max_auth_retries {
            return Err(SessionError::AuthRejected {
                attempts: self.auth_failures,
            });
        }
        self.shared.auth.refresh_token().await?;
        Ok(())
    }

    async fn connect_with_retry(&mut self) -> Result<Connection, SessionError> {
        let config = self.shared.config.clone();
        let max_attempts = config.max_connect_attempts.max(1);
        let timeout = config.connect_timeout();
        let extensions = if config.ack_extension {
            vec![Extension::Ack]
        } else {
            Vec::new()
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let token = self.shared.auth.get_token().await?;
            let request = ConnectRequest {
                url: self.shared.url.clone(),
                credential: token.as_str().to_string(),
                extensions: extensions.clone(),
            };

            let outcome = tokio::time::timeout(timeout, self.transport.connect(request)).await;
            let failure = match outcome {
                Ok(Ok(connection)) => return Ok(connection),
                Ok(Err(TransportError::Unauthorized(reason))) => {
                    log::warn!("handshake rejected credential: {reason}");
                    self.credential_rejected().await?;
                    // A refreshed credential is not a new connect attempt.
                    attempt -= 1;
                    continue;
                }
                Ok(Err(e)) => TransportConnectError::Refused(e.to_string()),
                Err(_) => TransportConnectError::Timeout(timeout),
            };

            if attempt >= max_attempts {
                return Err(if max_attempts == 1 {
                    failure.into()
                } else {
                    TransportConnectError::Exhausted {
                        attempts: attempt,
                        last: failure.to_string(),
                    }
                    .into()
                });
            }
            let delay = config.backoff(attempt);
            log::warn!("connect attempt {attempt}/{max_attempts} failed: {failure}; retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    /// Bring the server subscriptions in line with the live set, then
    /// answer the ops. `full` reconciles every channel, not just the ones
    /// named by the ops.
    async fn apply(&mut self, batch: Vec<Op>, full: bool) {
        let mut channels: BTreeSet<ChannelId> = batch
            .iter()
            .filter_map(|op| match op {
                Op::Sync { channel, .. } => Some(channel.clone()),
                Op::Publish { .. } => None,
            })
            .collect();
        if full {
            channels.extend(lock(&self.shared.live).iter().cloned());
            channels.extend(self.server.iter().cloned());
        }

        let mut rejected: HashMap<ChannelId, TransportError> = HashMap::new();
        let mut transient: HashSet<ChannelId> = HashSet::new();
        for channel in channels {
            match self.reconcile(&channel).await {
                Reconcile::Done => {
                    self.retry.remove(&channel);
                }
                Reconcile::Rejected(error) => {
                    self.retry.remove(&channel);
                    rejected.insert(channel, error);
                }
                Reconcile::Transient(error) => {
                    log::warn!("subscription to {channel} deferred: {error}");
                    self.retry.insert(channel.clone(), error);
                    transient.insert(channel);
                }
            }
        }
        if !self.retry.is_empty() && self.retry_at.is_none() {
            let delay = self.shared.config.backoff(self.retry_attempts + 1);
            self.retry_at = Some(Instant::now() + delay);
        }

        let mut reported: HashSet<ChannelId> = HashSet::new();
        for op in batch {
            match op {
                Op::Sync { channel, reply } => {
                    if transient.contains(&channel) {
                        self.deferred.push(Op::Sync { channel, reply });
                        continue;
                    }
                    let Some(reply) = reply else { continue };
                    let result = match rejected.get(&channel) {
                        Some(error) => Err(SubscriptionError::for_channel(&channel, error)),
                        None => Ok(()),
                    };
                    if result.is_err() {
                        reported.insert(channel);
                    }
                    let _ = reply.send(result);
                }
                Op::Publish {
                    channel,
                    data,
                    reply,
                } => {
                    let result = self.transport.publish(&channel, data).await;
                    let _ = reply.send(result.map_err(PublishError::from));
                }
            }
        }

        for (channel, error) in rejected {
            if !reported.contains(&channel) {
                self.shared
                    .events
                    .emit(&SessionEvent::SubscriptionFailed { channel, error });
            }
        }
    }

    /// Subscribe again to the channels that failed transiently on this
    /// connection. After `max_connect_attempts` rounds the waiting
    /// subscribes fail instead of hanging until the next reconnect.
    async fn retry_transient(&mut self) {
        self.retry_at = None;
        self.retry_attempts += 1;
        let mut batch = std::mem::take(&mut self.deferred);
        let waiting: HashSet<ChannelId> = batch
            .iter()
            .filter_map(|op| match op {
                Op::Sync { channel, .. } => Some(channel.clone()),
                Op::Publish { .. } => None,
            })
            .collect();
        for channel in std::mem::take(&mut self.retry).into_keys() {
            if !waiting.contains(&channel) {
                batch.push(Op::Sync {
                    channel,
                    reply: None,
                });
            }
        }
        self.apply(batch, false).await;

        if self.retry.is_empty() {
            self.retry_attempts = 0;
        } else if self.retry_attempts >= self.shared.config.max_connect_attempts.max(1) {
            self.abandon_retries();
        }
    }

    fn abandon_retries(&mut self) {
        let attempts = self.retry_attempts + 1;
        let failed = std::mem::take(&mut self.retry);
        self.retry_at = None;
        self.retry_attempts = 0;

        let mut reported: HashSet<ChannelId> = HashSet::new();
        for op in std::mem::take(&mut self.deferred) {
            match op {
                Op::Sync { channel, reply } => match failed.get(&channel) {
                    Some(error) => {
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(SubscriptionError::for_channel(&channel, error)));
                            reported.insert(channel);
                        }
                    }
                    None => self.deferred.push(Op::Sync { channel, reply }),
                },
                other => self.deferred.push(other),
            }
        }

        for (channel, error) in failed {
            log::warn!("giving up on {channel} after {attempts} subscribe attempts: {error}");
            lock(&self.shared.live).remove(&channel);
            if !reported.contains(&channel) {
                self.shared
                    .events
                    .emit(&SessionEvent::SubscriptionFailed { channel, error });
            }
        }
    }

    async fn reconcile(&mut self, channel: &ChannelId) -> Reconcile {
        let desired = self.shared.is_live(channel);
        let actual = self.server.contains(channel);
        match (desired, actual) {
            (true, false) => match self.transport.subscribe(channel).await {
                Ok(()) => {
                    log::debug!("subscribed {channel}");
                    self.auth_failures = 0;
                    self.server.insert(channel.clone());
                    Reconcile::Done
                }
                Err(error @ (TransportError::Rejected { .. } | TransportError::Unauthorized(_))) => {
                    log::warn!("subscription to {channel} refused: {error}");
                    lock(&self.shared.live).remove(channel);
                    Reconcile::Rejected(error)
                }
                Err(error) => Reconcile::Transient(error),
            },
            (false, true) => {
                self.server.remove(channel);
                if let Err(error) = self.transport.unsubscribe(channel).await {
                    log::warn!("unsubscribe from {channel} failed: {error}");
                }
                log::debug!("unsubscribed {channel}");
                Reconcile::Done
            }
            _ => Reconcile::Done,
        }
    }
}
