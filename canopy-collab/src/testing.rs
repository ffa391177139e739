//! In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canopy_core::{ChannelId, DocumentRef, RecordOp};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::auth::{IdentityProvider, ListenerId, ProviderEvent, ProviderEventKind, ProviderListener};
use crate::broadcast::lock;
use crate::cache::{RecordBackend, RecordWrite, RemoteRecord, WriteAck};
use crate::error::{BackendError, ProviderError, TransportError};
use crate::transport::{
    ConnectRequest, Connection, Extension, Preloaded, SessionInfo, Transport, TransportEvent,
};

// ─── Identity provider ──────────────────────────────────────────────

/// Provider whose answers are queued up front. Its own `sign_in` and
/// `sign_out` never fire listeners; `external_*` do.
pub(crate) struct ScriptedProvider {
    current: Mutex<Option<String>>,
    sign_in_results: Mutex<VecDeque<Result<String, ProviderError>>>,
    sign_out_failure: Mutex<Option<ProviderError>>,
    refreshes: Mutex<VecDeque<String>>,
    sign_in_delay: Mutex<Duration>,
    sign_in_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    listeners: Mutex<Vec<(ListenerId, ProviderEventKind, ProviderListener)>>,
    next_id: AtomicU64,
}

impl ScriptedProvider {
    pub(crate) fn new(token: Option<&str>) -> Self {
        Self {
            current: Mutex::new(token.map(str::to_string)),
            sign_in_results: Mutex::default(),
            sign_out_failure: Mutex::default(),
            refreshes: Mutex::default(),
            sign_in_delay: Mutex::new(Duration::ZERO),
            sign_in_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            listeners: Mutex::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn set_sign_in_delay(&self, delay: Duration) {
        *lock(&self.sign_in_delay) = delay;
    }

    pub(crate) fn push_sign_in(&self, result: Result<String, ProviderError>) {
        lock(&self.sign_in_results).push_back(result);
    }

    pub(crate) fn fail_sign_out(&self, error: ProviderError) {
        *lock(&self.sign_out_failure) = Some(error);
    }

    /// The next `get_token` yields `token` and makes it current.
    pub(crate) fn push_refresh(&self, token: &str) {
        lock(&self.refreshes).push_back(token.to_string());
    }

    pub(crate) fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub(crate) fn external_sign_in(&self, token: &str) {
        *lock(&self.current) = Some(token.to_string());
        self.fire(ProviderEvent::SignedIn {
            token: Some(token.to_string()),
        });
    }

    pub(crate) fn external_sign_out(&self) {
        *lock(&self.current) = None;
        self.fire(ProviderEvent::SignedOut);
    }

    fn fire(&self, event: ProviderEvent) {
        let kind = event.kind();
        let targets: Vec<ProviderListener> = lock(&self.listeners)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, l)| l.clone())
            .collect();
        for listener in targets {
            listener(&event);
        }
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    fn token_or_none(&self) -> Option<String> {
        lock(&self.current).clone()
    }

    async fn get_token(&self) -> Result<Option<String>, ProviderError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let refreshed = lock(&self.refreshes).pop_front();
        if let Some(token) = refreshed {
            *lock(&self.current) = Some(token.clone());
            return Ok(Some(token));
        }
        Ok(self.token_or_none())
    }

    async fn sign_in(&self) -> Result<String, ProviderError> {
        let n = self.sign_in_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *lock(&self.sign_in_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = lock(&self.sign_in_results).pop_front();
        let result = scripted.unwrap_or_else(|| Ok(format!("token-{n}")));
        if let Ok(token) = &result {
            *lock(&self.current) = Some(token.clone());
        }
        result
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let failure = lock(&self.sign_out_failure).take();
        if let Some(error) = failure {
            return Err(error);
        }
        *lock(&self.current) = None;
        Ok(())
    }

    async fn verify(&self, token: &str) -> Result<(), ProviderError> {
        if lock(&self.current).as_deref() == Some(token) {
            Ok(())
        } else {
            Err(ProviderError::new("token not recognized"))
        }
    }

    fn add_listener(&self, kind: ProviderEventKind, listener: ProviderListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, kind, listener));
        id
    }

    fn remove_listener(&self, kind: ProviderEventKind, id: ListenerId) {
        lock(&self.listeners).retain(|(i, k, _)| !(*i == id && *k == kind));
    }
}

// ─── Transport ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Connect { credential: String },
    Subscribe(ChannelId),
    Unsubscribe(ChannelId),
    Publish(ChannelId, Value),
    Disconnect,
}

#[derive(Default)]
struct MemoryState {
    events: Option<mpsc::Sender<TransportEvent>>,
    calls: Vec<Call>,
    connect_failures: VecDeque<TransportError>,
    required_credential: Option<String>,
    subscribe_rejections: HashMap<ChannelId, String>,
    subscribe_failures: VecDeque<TransportError>,
    connect_delay: Duration,
    connections: usize,
}

/// Transport that records every call and lets the test push events into
/// the current connection.
#[derive(Default)]
pub(crate) struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn loader(self: &Arc<Self>) -> Arc<Preloaded> {
        Arc::new(Preloaded(self.clone()))
    }

    pub(crate) fn fail_next_connects(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.connect_failures.push_back(error.clone());
        }
    }

    /// Handshakes with any other credential are refused as unauthorized.
    pub(crate) fn require_credential(&self, credential: &str) {
        lock(&self.state).required_credential = Some(credential.to_string());
    }

    pub(crate) fn reject_subscribe(&self, channel: &ChannelId, reason: &str) {
        lock(&self.state)
            .subscribe_rejections
            .insert(channel.clone(), reason.to_string());
    }

    /// The next `count` subscribe calls fail with `error` on a live link.
    pub(crate) fn fail_next_subscribes(&self, count: usize, error: TransportError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.subscribe_failures.push_back(error.clone());
        }
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        lock(&self.state).calls.clone()
    }

    pub(crate) fn connections(&self) -> usize {
        lock(&self.state).connections
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.count(|c| matches!(c, Call::Connect { .. }))
    }

    pub(crate) fn subscribes(&self, channel: &ChannelId) -> usize {
        self.count(|c| c == &Call::Subscribe(channel.clone()))
    }

    pub(crate) fn unsubscribes(&self, channel: &ChannelId) -> usize {
        self.count(|c| c == &Call::Unsubscribe(channel.clone()))
    }

    fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    fn push(&self, event: TransportEvent) -> bool {
        let state = lock(&self.state);
        state
            .events
            .as_ref()
            .is_some_and(|events| events.try_send(event).is_ok())
    }

    /// Inject a server message on the live connection.
    pub(crate) fn deliver(&self, channel: &ChannelId, data: Value) -> bool {
        self.push(TransportEvent::Message {
            channel: channel.clone(),
            data,
        })
    }

    /// Kill the live connection as a network failure would.
    pub(crate) fn drop_connection(&self, reason: &str) -> bool {
        let sent = self.push(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
        lock(&self.state).events = None;
        sent
    }

    pub(crate) fn revoke_credential(&self, reason: &str) -> bool {
        self.push(TransportEvent::AuthRejected {
            reason: reason.to_string(),
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        let delay = {
            let mut state = lock(&self.state);
            state.calls.push(Call::Connect {
                credential: request.credential.clone(),
            });
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        if let Some(required) = &state.required_credential {
            if *required != request.credential {
                return Err(TransportError::Unauthorized("401::Unauthorized".to_string()));
            }
        }
        state.connections += 1;
        let (tx, rx) = mpsc::channel(64);
        state.events = Some(tx);
        Ok(Connection {
            info: SessionInfo {
                client_id: format!("mem-{}", state.connections),
                ack: request.wants(Extension::Ack),
            },
            events: rx,
        })
    }

    async fn subscribe(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(Call::Subscribe(channel.clone()));
        if state.events.is_none() {
            return Err(TransportError::Closed);
        }
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }
        match state.subscribe_rejections.get(channel) {
            Some(reason) => Err(TransportError::Rejected {
                channel: channel.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), TransportError> {
        lock(&self.state).calls.push(Call::Unsubscribe(channel.clone()));
        Ok(())
    }

    async fn publish(&self, channel: &ChannelId, data: Value) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.calls.push(Call::Publish(channel.clone(), data));
        if state.events.is_none() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = lock(&self.state);
        state.calls.push(Call::Disconnect);
        state.events = None;
    }
}

// ─── Record backend ─────────────────────────────────────────────────

#[derive(Default)]
struct BackendState {
    records: HashMap<(String, String), (Value, u64)>,
    writes: Vec<RecordWrite>,
    rejections: VecDeque<String>,
    write_delay: Duration,
    snapshot_delay: Duration,
    snapshot_calls: usize,
}

/// Authoritative store for cache tests. Acks with
/// `max(stored + 1, optimistic)`.
#[derive(Default)]
pub(crate) struct MemoryBackend {
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    pub(crate) fn seed(&self, collection: &str, record: &str, payload: Value, revision: u64) {
        lock(&self.state)
            .records
            .insert((collection.to_string(), record.to_string()), (payload, revision));
    }

    pub(crate) fn remove(&self, collection: &str, record: &str) {
        lock(&self.state)
            .records
            .remove(&(collection.to_string(), record.to_string()));
    }

    pub(crate) fn set_write_delay(&self, delay: Duration) {
        lock(&self.state).write_delay = delay;
    }

    pub(crate) fn set_snapshot_delay(&self, delay: Duration) {
        lock(&self.state).snapshot_delay = delay;
    }

    pub(crate) fn reject_next_write(&self, reason: &str) {
        lock(&self.state).rejections.push_back(reason.to_string());
    }

    pub(crate) fn writes(&self) -> Vec<RecordWrite> {
        lock(&self.state).writes.clone()
    }

    pub(crate) fn snapshot_calls(&self) -> usize {
        lock(&self.state).snapshot_calls
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn snapshot(
        &self,
        _document: DocumentRef,
        collection: &str,
    ) -> Result<Vec<RemoteRecord>, BackendError> {
        let delay = {
            let mut state = lock(&self.state);
            state.snapshot_calls += 1;
            state.snapshot_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let state = lock(&self.state);
        let mut records: Vec<RemoteRecord> = state
            .records
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, record), (payload, revision))| RemoteRecord {
                record: record.clone(),
                payload: payload.clone(),
                revision: *revision,
            })
            .collect();
        records.sort_by(|a, b| a.record.cmp(&b.record));
        Ok(records)
    }

    async fn write(&self, write: RecordWrite) -> Result<WriteAck, BackendError> {
        let delay = {
            let mut state = lock(&self.state);
            state.writes.push(write.clone());
            state.write_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock(&self.state);
        if let Some(reason) = state.rejections.pop_front() {
            return Err(BackendError::Rejected(reason));
        }
        let key = (write.reference.collection.clone(), write.reference.record.clone());
        let stored = state.records.get(&key).map_or(0, |(_, revision)| *revision);
        let revision = (stored + 1).max(write.revision);
        match (write.op, write.payload) {
            (RecordOp::Set, Some(payload)) => {
                state.records.insert(key, (payload, revision));
            }
            _ => {
                state.records.remove(&key);
            }
        }
        Ok(WriteAck { revision })
    }
}

/// Poll `condition` on the tokio clock until it holds or `limit` passes.
pub(crate) async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
