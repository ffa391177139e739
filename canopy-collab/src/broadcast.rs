//! Typed in-process fan-out with ordered listeners.
//!
//! Vendor callback shapes (identity provider, transport) are translated into
//! a [`Listeners<T>`] at the adapter boundary; everything above that point
//! subscribes to typed events only.
//!
//! Delivery rules:
//! - listeners run synchronously, in subscription order;
//! - the listener list is snapshotted before dispatch, so subscribing or
//!   unsubscribing from inside a listener never disturbs the running pass;
//! - a listener unsubscribed mid-pass is skipped if it has not run yet;
//! - a panicking listener is caught and logged, the pass continues;
//! - after [`Listeners::close`] nothing is delivered, not even the rest of
//!   a pass already in progress.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Lock a std mutex, recovering the data if a listener panicked while a
/// guard was held elsewhere.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by every `subscribe`/`on_*` call.
///
/// Dropping it does NOT unsubscribe; call [`Subscription::unsubscribe`].
/// Unsubscribing is idempotent and safe from inside the listener itself.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    /// A subscription with nothing to cancel (e.g. subscribing to a closed
    /// broadcast point).
    pub fn inert() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }

    pub fn unsubscribe(&self) {
        let cancel = lock(&self.cancel).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.cancel).is_some()
    }

    /// Combine several subscriptions into one handle.
    pub fn all(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || {
            for s in &subscriptions {
                s.unsubscribe();
            }
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub emitted: u64,
    pub delivered: u64,
    pub panicked: u64,
    pub listeners: usize,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    active: AtomicBool,
    callback: Callback<T>,
}

struct Inner<T> {
    entries: Mutex<Vec<Arc<Entry<T>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    emitted: AtomicU64,
    delivered: AtomicU64,
    panicked: AtomicU64,
}

/// An ordered, multi-subscriber broadcast point.
pub struct Listeners<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                emitted: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
            }),
        }
    }

    /// Register a listener at the end of the delivery order.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        if self.is_closed() {
            return Subscription::inert();
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(Entry {
            id,
            active: AtomicBool::new(true),
            callback: Arc::new(callback),
        });
        lock(&self.inner.entries).push(entry.clone());

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            entry.active.store(false, Ordering::Release);
            if let Some(inner) = weak.upgrade() {
                lock(&inner.entries).retain(|e| e.id != entry.id);
            }
        })
    }

    /// Deliver `value` to every listener. Returns how many ran to completion.
    pub fn emit(&self, value: &T) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        let snapshot: Vec<Arc<Entry<T>>> = lock(&self.inner.entries).clone();

        let mut delivered = 0;
        for entry in snapshot {
            if self.is_closed() {
                break;
            }
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }
            let callback = entry.callback.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.inner.panicked.fetch_add(1, Ordering::Relaxed);
                    log::error!("listener {} panicked; continuing delivery", entry.id);
                }
            }
        }
        self.inner
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Drop every listener and refuse new ones. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<_> = std::mem::take(&mut *lock(&self.inner.entries));
        for entry in &drained {
            entry.active.store(false, Ordering::Release);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            emitted: self.inner.emitted.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            panicked: self.inner.panicked.load(Ordering::Relaxed),
            listeners: self.len(),
        }
    }
}
