//! Document/record state cache.
//!
//! One [`RecordCache`] per open document maps `(collection, record)` to the
//! latest known payload. Remote changes arrive through the registry on the
//! collection's record channel; local writes are applied optimistically and
//! forwarded to the [`RecordBackend`].
//!
//! Revision rules:
//! - a local write gets `current + 1` and is visible immediately;
//! - a remote change with revision `>= current` overwrites, anything older
//!   is discarded;
//! - an acknowledged write keeps `max(ack, optimistic)`;
//! - a rejected or timed-out write rolls back to the last confirmed value,
//!   unless something newer already replaced it.
//!
//! Deleted records are kept as tombstones so a late, older change cannot
//! resurrect them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use canopy_core::document::valid_segment;
use canopy_core::{ChannelMessage, DocumentRef, RecordChange, RecordOp, RecordRef};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::broadcast::{lock, Listeners, Subscription};
use crate::config::CacheConfig;
use crate::error::{BackendError, OpenError, SubscriptionError, WriteError};
use crate::registry::ChannelRegistry;

// ─── Backend boundary ───────────────────────────────────────────────

/// One record of an authoritative snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub record: String,
    pub payload: Value,
    pub revision: u64,
}

/// A local mutation forwarded to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub reference: RecordRef,
    pub op: RecordOp,
    pub payload: Option<Value>,
    /// The optimistic revision the cache assigned.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub revision: u64,
}

#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn snapshot(
        &self,
        document: DocumentRef,
        collection: &str,
    ) -> Result<Vec<RemoteRecord>, BackendError>;

    async fn write(&self, write: RecordWrite) -> Result<WriteAck, BackendError>;
}

// ─── Read model ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub reference: RecordRef,
    pub payload: Value,
    pub revision: u64,
    /// A local write for this value is not acknowledged yet.
    pub pending: bool,
}

/// Result of [`CollectionView::get`]. `Loading` is never a deletion.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordLookup {
    Loading,
    Missing,
    Present(RecordSnapshot),
}

impl RecordLookup {
    pub fn is_loading(&self) -> bool {
        matches!(self, RecordLookup::Loading)
    }

    pub fn present(&self) -> Option<&RecordSnapshot> {
        match self {
            RecordLookup::Present(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        self.present().map(|snapshot| &snapshot.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Changed {
        record: RecordSnapshot,
        origin: ChangeOrigin,
    },
    Removed {
        reference: RecordRef,
        origin: ChangeOrigin,
    },
    /// A local write failed; `restored` is the value now visible.
    RolledBack {
        reference: RecordRef,
        restored: Option<RecordSnapshot>,
        error: WriteError,
    },
    /// A snapshot was applied. Replaces per-record events for that load.
    Loaded { collection: String, records: usize },
    /// The session resynced; cached values may have missed changes.
    Stale { collection: String },
}

/// An optimistic write awaiting acknowledgement.
pub struct PendingWrite {
    reference: RecordRef,
    record: Option<RecordSnapshot>,
    outcome: oneshot::Receiver<Result<WriteAck, WriteError>>,
}

impl PendingWrite {
    pub fn reference(&self) -> &RecordRef {
        &self.reference
    }

    /// The optimistic value; `None` for a delete.
    pub fn record(&self) -> Option<&RecordSnapshot> {
        self.record.as_ref()
    }

    pub async fn confirmed(self) -> Result<WriteAck, WriteError> {
        self.outcome.await.unwrap_or(Err(WriteError::Disposed))
    }
}

// ─── State ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Version {
    payload: Option<Value>,
    revision: u64,
}

impl Version {
    const ABSENT: Version = Version {
        payload: None,
        revision: 0,
    };
}

struct Slot {
    current: Version,
    confirmed: Version,
    /// Id of the local write that produced `current`, until it settles or
    /// a remote change replaces it.
    pending: Option<u64>,
    /// Value of [`Collection::changes`] at the last remote change, local
    /// write or ack that touched this record.
    touched: u64,
}

impl Slot {
    fn empty() -> Self {
        Self {
            current: Version::ABSENT,
            confirmed: Version::ABSENT,
            pending: None,
            touched: 0,
        }
    }

    fn overwrite(&mut self, version: Version) {
        self.current = version.clone();
        self.confirmed = version;
        self.pending = None;
    }
}

#[derive(Default)]
struct Collection {
    loaded: bool,
    stale: bool,
    slots: BTreeMap<String, Slot>,
    subscription: Option<Subscription>,
    /// Bumped by every change applied outside a snapshot.
    changes: u64,
}

impl Collection {
    fn touch(&mut self) -> u64 {
        self.changes += 1;
        self.changes
    }
}

struct CacheState {
    collections: HashMap<String, Collection>,
    next_write: u64,
}

fn snapshot_of(reference: &RecordRef, slot: &Slot) -> Option<RecordSnapshot> {
    slot.current.payload.as_ref().map(|payload| RecordSnapshot {
        reference: reference.clone(),
        payload: payload.clone(),
        revision: slot.current.revision,
        pending: slot.pending.is_some(),
    })
}

struct CacheInner {
    document: DocumentRef,
    registry: ChannelRegistry,
    backend: Arc<dyn RecordBackend>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    events: Listeners<CacheEvent>,
    stale_discarded: AtomicU64,
    resync: Mutex<Option<Subscription>>,
    disposed: AtomicBool,
}

impl CacheInner {
    fn on_delivery(&self, delivery: Result<&ChannelMessage, &SubscriptionError>) {
        match delivery {
            Ok(ChannelMessage::RecordChange(change)) => self.apply_remote(change),
            Ok(other) => log::debug!("ignoring non-record message on record channel: {other:?}"),
            Err(error) => log::warn!("record channel for {}: {error}", self.document),
        }
    }

    fn apply_remote(&self, change: &RecordChange) {
        let reference = self.document.record(&change.collection, &change.record);
        let event = {
            let mut state = lock(&self.state);
            let Some(collection) = state.collections.get_mut(&change.collection) else {
                return;
            };
            let touched = collection.touch();
            let slot = collection
                .slots
                .entry(change.record.clone())
                .or_insert_with(Slot::empty);
            if change.revision < slot.current.revision {
                self.stale_discarded.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "discarding stale change to {reference}: r{} < r{}",
                    change.revision,
                    slot.current.revision
                );
                return;
            }

            let was_present = slot.current.payload.is_some();
            let payload = match change.op {
                RecordOp::Set => Some(change.payload.clone().unwrap_or(Value::Null)),
                RecordOp::Delete => None,
            };
            slot.overwrite(Version {
                payload,
                revision: change.revision,
            });
            slot.touched = touched;
            match snapshot_of(&reference, slot) {
                Some(record) => Some(CacheEvent::Changed {
                    record,
                    origin: ChangeOrigin::Remote,
                }),
                None if was_present => Some(CacheEvent::Removed {
                    reference,
                    origin: ChangeOrigin::Remote,
                }),
                None => None,
            }
        };
        if let Some(event) = event {
            self.events.emit(&event);
        }
    }

    /// `since` is the collection's change count when the fetch started.
    /// Records changed after that are newer than the snapshot's view.
    fn apply_snapshot(&self, collection: &str, records: Vec<RemoteRecord>, since: u64) {
        let count = {
            let mut state = lock(&self.state);
            let Some(entry) = state.collections.get_mut(collection) else {
                return;
            };
            let mut seen = HashSet::new();
            for remote in records {
                seen.insert(remote.record.clone());
                let slot = entry.slots.entry(remote.record).or_insert_with(Slot::empty);
                if remote.revision < slot.current.revision {
                    self.stale_discarded.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                slot.overwrite(Version {
                    payload: Some(remote.payload),
                    revision: remote.revision,
                });
            }
            // Absent from an authoritative snapshot means deleted upstream.
            for (id, slot) in entry.slots.iter_mut() {
                if !seen.contains(id)
                    && slot.pending.is_none()
                    && slot.touched <= since
                    && slot.current.payload.is_some()
                {
                    slot.current.payload = None;
                    slot.confirmed = slot.current.clone();
                }
            }
            entry.loaded = true;
            entry.stale = false;
            entry
                .slots
                .values()
                .filter(|slot| slot.current.payload.is_some())
                .count()
        };
        log::debug!("loaded {count} records of {collection}");
        self.events.emit(&CacheEvent::Loaded {
            collection: collection.to_string(),
            records: count,
        });
    }

    async fn load(&self, collection: &str) -> Result<(), OpenError> {
        let timeout = self.config.snapshot_timeout();
        let since = lock(&self.state)
            .collections
            .get(collection)
            .map_or(0, |entry| entry.changes);
        let fetched =
            tokio::time::timeout(timeout, self.backend.snapshot(self.document, collection)).await;
        let records = match fetched {
            Ok(records) => records?,
            Err(_) => return Err(OpenError::Timeout(timeout)),
        };
        self.apply_snapshot(collection, records, since);
        Ok(())
    }

    fn write_local(
        self: &Arc<Self>,
        collection: &str,
        id: &str,
        payload: Option<Value>,
    ) -> Result<PendingWrite, WriteError> {
        let reference = self.document.record(collection, id);
        if !reference.is_valid() {
            return Err(WriteError::InvalidRef(reference.to_string()));
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(WriteError::Disposed);
        }

        let (record, write_id, revision) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let Some(entry) = state.collections.get_mut(collection) else {
                return Err(WriteError::NotOpen(collection.to_string()));
            };
            let write_id = state.next_write;
            state.next_write += 1;
            let touched = entry.touch();
            let slot = entry.slots.entry(id.to_string()).or_insert_with(Slot::empty);
            slot.touched = touched;
            let revision = slot.current.revision + 1;
            slot.current = Version {
                payload: payload.clone(),
                revision,
            };
            slot.pending = Some(write_id);
            (snapshot_of(&reference, slot), write_id, revision)
        };

        self.events.emit(&match &record {
            Some(record) => CacheEvent::Changed {
                record: record.clone(),
                origin: ChangeOrigin::Local,
            },
            None => CacheEvent::Removed {
                reference: reference.clone(),
                origin: ChangeOrigin::Local,
            },
        });

        let write = RecordWrite {
            reference: reference.clone(),
            op: if payload.is_some() {
                RecordOp::Set
            } else {
                RecordOp::Delete
            },
            payload,
            revision,
        };
        let (tx, rx) = oneshot::channel();
        let inner = self.clone();
        tokio::spawn(async move {
            let timeout = inner.config.write_timeout();
            let sent = tokio::time::timeout(timeout, inner.backend.write(write.clone())).await;
            let result = match sent {
                Ok(Ok(ack)) => Ok(ack),
                Ok(Err(e)) => Err(WriteError::Rejected {
                    record: write.reference.to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(WriteError::Timeout(timeout)),
            };
            inner.settle(&write, write_id, &result);
            let _ = tx.send(result);
        });

        Ok(PendingWrite {
            reference,
            record,
            outcome: rx,
        })
    }

    fn settle(&self, write: &RecordWrite, write_id: u64, result: &Result<WriteAck, WriteError>) {
        let reference = &write.reference;
        let event = {
            let mut state = lock(&self.state);
            let Some(collection) = state.collections.get_mut(&reference.collection) else {
                return;
            };
            let touched = collection.touch();
            let Some(slot) = collection.slots.get_mut(&reference.record) else {
                return;
            };
            slot.touched = touched;
            let ours = slot.pending == Some(write_id);
            match result {
                Ok(ack) => {
                    let revision = ack.revision.max(write.revision);
                    if ours {
                        slot.pending = None;
                        slot.current.revision = slot.current.revision.max(revision);
                        slot.confirmed = slot.current.clone();
                    } else if slot.pending.is_some() && revision > slot.confirmed.revision {
                        // A later local write sits on top of this one.
                        slot.confirmed = Version {
                            payload: write.payload.clone(),
                            revision,
                        };
                    }
                    None
                }
                Err(error) if ours => {
                    log::warn!("write to {reference} failed, rolling back: {error}");
                    slot.pending = None;
                    slot.current = slot.confirmed.clone();
                    Some(CacheEvent::RolledBack {
                        reference: reference.clone(),
                        restored: snapshot_of(reference, slot),
                        error: error.clone(),
                    })
                }
                Err(error) => {
                    log::warn!("write to {reference} failed after being superseded: {error}");
                    None
                }
            }
        };
        if let Some(event) = event {
            self.events.emit(&event);
        }
    }

    fn on_resynced(self: &Arc<Self>) {
        let stale: Vec<String> = {
            let mut state = lock(&self.state);
            state
                .collections
                .iter_mut()
                .filter(|(_, collection)| collection.loaded)
                .map(|(name, collection)| {
                    collection.stale = true;
                    name.clone()
                })
                .collect()
        };
        for name in &stale {
            self.events.emit(&CacheEvent::Stale {
                collection: name.clone(),
            });
        }
        if !self.config.refetch_on_resync {
            return;
        }
        for name in stale {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.load(&name).await {
                    log::warn!("refetch of {name} after resync failed: {e}");
                }
            });
        }
    }

    /// Drop a collection and release its channel.
    fn forget(&self, collection: &str) {
        let removed = lock(&self.state).collections.remove(collection);
        if let Some(subscription) = removed.and_then(|c| c.subscription) {
            subscription.unsubscribe();
        }
    }
}

// ─── Public handles ─────────────────────────────────────────────────

/// Cache for one document. Cheap to clone.
#[derive(Clone)]
pub struct RecordCache {
    inner: Arc<CacheInner>,
}

impl RecordCache {
    pub fn new(
        document: DocumentRef,
        registry: ChannelRegistry,
        backend: Arc<dyn RecordBackend>,
        config: CacheConfig,
    ) -> Self {
        let inner = Arc::new(CacheInner {
            document,
            registry: registry.clone(),
            backend,
            config,
            state: Mutex::new(CacheState {
                collections: HashMap::new(),
                next_write: 1,
            }),
            events: Listeners::new(),
            stale_discarded: AtomicU64::new(0),
            resync: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        let weak: Weak<CacheInner> = Arc::downgrade(&inner);
        let resync = registry.on_resynced(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_resynced();
            }
        });
        *lock(&inner.resync) = Some(resync);
        Self { inner }
    }

    pub fn document(&self) -> DocumentRef {
        self.inner.document
    }

    /// Subscribe the collection's record channel, then load its snapshot.
    /// Opening an open collection returns at once.
    pub async fn open(&self, collection: &str) -> Result<CollectionView, OpenError> {
        if !valid_segment(collection) {
            return Err(OpenError::InvalidCollection(collection.to_string()));
        }
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(OpenError::Disposed);
        }
        {
            let mut state = lock(&self.inner.state);
            if state.collections.contains_key(collection) {
                return Ok(self.collection(collection));
            }
            state
                .collections
                .insert(collection.to_string(), Collection::default());
        }

        let weak = Arc::downgrade(&self.inner);
        let channel = self.inner.document.records_channel(collection);
        let subscribed = self
            .inner
            .registry
            .subscribe(channel, move |delivery| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_delivery(delivery);
                }
            })
            .await;
        let subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                self.inner.forget(collection);
                return Err(e.into());
            }
        };

        let orphaned = {
            let mut state = lock(&self.inner.state);
            match state.collections.get_mut(collection) {
                Some(entry) => {
                    entry.subscription = Some(subscription);
                    None
                }
                None => Some(subscription),
            }
        };
        if let Some(subscription) = orphaned {
            subscription.unsubscribe();
            return Err(OpenError::Disposed);
        }

        if let Err(e) = self.inner.load(collection).await {
            log::warn!("opening {collection} failed: {e}");
            self.inner.forget(collection);
            return Err(e);
        }
        log::info!("opened collection {collection} of {}", self.inner.document);
        Ok(self.collection(collection))
    }

    /// Stop tracking `collection`. Its views read `Loading` afterwards.
    pub fn close(&self, collection: &str) {
        self.inner.forget(collection);
    }

    /// View over `collection`, open or not.
    pub fn collection(&self, name: &str) -> CollectionView {
        CollectionView {
            inner: self.inner.clone(),
            name: name.to_string(),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&CacheEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    /// Remote changes dropped by the revision rule.
    pub fn stale_discarded(&self) -> u64 {
        self.inner.stale_discarded.load(Ordering::Relaxed)
    }

    /// Release every collection and silence listeners. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let resync = lock(&self.inner.resync).take();
        if let Some(resync) = resync {
            resync.unsubscribe();
        }
        let collections: Vec<Collection> = lock(&self.inner.state)
            .collections
            .drain()
            .map(|(_, c)| c)
            .collect();
        for subscription in collections.into_iter().filter_map(|c| c.subscription) {
            subscription.unsubscribe();
        }
        self.inner.events.close();
    }
}

/// Read/write handle on one collection of a [`RecordCache`].
#[derive(Clone)]
pub struct CollectionView {
    inner: Arc<CacheInner>,
    name: String,
}

impl CollectionView {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.inner.state)
            .collections
            .get(&self.name)
            .is_some_and(|c| c.loaded)
    }

    /// True between a resync and the refetched snapshot.
    pub fn is_stale(&self) -> bool {
        lock(&self.inner.state)
            .collections
            .get(&self.name)
            .is_some_and(|c| c.stale)
    }

    /// Refs of every record currently present, ordered by record id.
    pub fn records(&self) -> Vec<RecordRef> {
        self.snapshots()
            .into_iter()
            .map(|snapshot| snapshot.reference)
            .collect()
    }

    pub fn snapshots(&self) -> Vec<RecordSnapshot> {
        let state = lock(&self.inner.state);
        let Some(collection) = state.collections.get(&self.name) else {
            return Vec::new();
        };
        collection
            .slots
            .iter()
            .filter_map(|(id, slot)| snapshot_of(&self.inner.document.record(&self.name, id), slot))
            .collect()
    }

    pub fn get(&self, id: &str) -> RecordLookup {
        let state = lock(&self.inner.state);
        let Some(collection) = state.collections.get(&self.name) else {
            return RecordLookup::Loading;
        };
        let reference = self.inner.document.record(&self.name, id);
        match collection.slots.get(id).and_then(|slot| snapshot_of(&reference, slot)) {
            Some(snapshot) => RecordLookup::Present(snapshot),
            None if collection.loaded => RecordLookup::Missing,
            None => RecordLookup::Loading,
        }
    }

    /// Optimistic write. Must be called inside a Tokio runtime.
    pub fn set(&self, id: &str, payload: Value) -> Result<PendingWrite, WriteError> {
        self.inner.write_local(&self.name, id, Some(payload))
    }

    pub fn delete(&self, id: &str) -> Result<PendingWrite, WriteError> {
        self.inner.write_local(&self.name, id, None)
    }
}
