//! Channel subscription registry.
//!
//! "Subscribe to channel X, get callback(message)" over the one shared
//! session. Each channel id maps to an ordered handler list; the handler
//! count is the reference count, so the session sees exactly one subscribe
//! when the count leaves zero and one unsubscribe when it returns to zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use canopy_core::{ChannelId, ChannelMessage};

use crate::broadcast::{lock, Listeners, Subscription};
use crate::error::{PublishError, SessionError, SubscriptionError};
use crate::session::{InboundMessage, SessionEvent, SessionManager};

/// What a handler receives: a decoded message or this channel's failure.
pub type Delivery = Result<ChannelMessage, SubscriptionError>;

struct ChannelEntry {
    handlers: Listeners<Delivery>,
    count: usize,
    /// Distinguishes this entry from a later one for the same channel.
    generation: u64,
}

struct RegistryInner {
    session: SessionManager,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    next_generation: AtomicU64,
    resynced: Listeners<()>,
    session_subscriptions: Mutex<Vec<Subscription>>,
    disposed: AtomicBool,
}

impl RegistryInner {
    fn handlers_for(&self, channel: &ChannelId) -> Option<Listeners<Delivery>> {
        lock(&self.channels)
            .get(channel)
            .map(|entry| entry.handlers.clone())
    }

    fn dispatch(&self, message: &InboundMessage) {
        let Some(handlers) = self.handlers_for(&message.channel) else {
            return;
        };
        let delivery = ChannelMessage::decode(message.channel.kind(), &message.data).map_err(|e| {
            log::warn!("undecodable payload on {}: {e}", message.channel);
            SubscriptionError::Decode {
                channel: message.channel.to_string(),
                reason: e.to_string(),
            }
        });
        handlers.emit(&delivery);
    }

    fn on_session_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Resynced => {
                self.resynced.emit(&());
            }
            SessionEvent::Fatal(error) => {
                let all: Vec<Listeners<Delivery>> = lock(&self.channels)
                    .values()
                    .map(|entry| entry.handlers.clone())
                    .collect();
                let delivery: Delivery = Err(SubscriptionError::Session(error.clone()));
                for handlers in all {
                    handlers.emit(&delivery);
                }
            }
            SessionEvent::SubscriptionFailed { channel, error } => {
                let removed = lock(&self.channels).remove(channel);
                if let Some(entry) = removed {
                    entry
                        .handlers
                        .emit(&Err(SubscriptionError::for_channel(channel, error)));
                    entry.handlers.close();
                }
            }
            SessionEvent::Connected { .. } | SessionEvent::Disconnected { .. } => {}
        }
    }

    /// The first subscribe for `channel` failed. Handlers that joined while
    /// it was in flight get the error and are dropped with the entry.
    fn abandon(&self, channel: &ChannelId, generation: u64, error: &SubscriptionError) {
        let removed = {
            let mut channels = lock(&self.channels);
            match channels.get(channel) {
                Some(entry) if entry.generation == generation => channels.remove(channel),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            self.session.unsubscribe(channel);
            entry.handlers.emit(&Err(error.clone()));
            entry.handlers.close();
        }
    }

    fn release(&self, channel: &ChannelId, generation: u64) {
        let mut channels = lock(&self.channels);
        let Some(entry) = channels.get_mut(channel) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.count = entry.count.saturating_sub(1);
        if entry.count == 0 {
            channels.remove(channel);
            self.session.unsubscribe(channel);
            log::debug!("last handler left {channel}");
        }
    }
}

/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(session: SessionManager) -> Self {
        let inner = Arc::new(RegistryInner {
            session: session.clone(),
            channels: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            resynced: Listeners::new(),
            session_subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        let on_message = session.on_message(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(message);
            }
        });
        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        let on_event = session.on_session_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_session_event(event);
            }
        });
        *lock(&inner.session_subscriptions) = vec![on_message, on_event];

        Self { inner }
    }

    pub fn session(&self) -> &SessionManager {
        &self.inner.session
    }

    /// Register `handler` on `channel`. The first handler for a channel
    /// waits for the server to confirm the subscription; later handlers
    /// join immediately and receive the error if that confirmation fails.
    pub async fn subscribe(
        &self,
        channel: ChannelId,
        handler: impl Fn(Result<&ChannelMessage, &SubscriptionError>) + Send + Sync + 'static,
    ) -> Result<Subscription, SubscriptionError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(SubscriptionError::Disposed);
        }

        let (subscription, pending, generation) = {
            let mut channels = lock(&self.inner.channels);
            let entry = channels.entry(channel.clone()).or_insert_with(|| ChannelEntry {
                handlers: Listeners::new(),
                count: 0,
                generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            });
            entry.count += 1;
            let listener = entry
                .handlers
                .subscribe(move |delivery: &Delivery| handler(delivery.as_ref()));
            let pending = (entry.count == 1).then(|| self.inner.session.subscribe(channel.clone()));

            let generation = entry.generation;
            let weak = Arc::downgrade(&self.inner);
            let released = channel.clone();
            let subscription = Subscription::new(move || {
                listener.unsubscribe();
                if let Some(inner) = weak.upgrade() {
                    inner.release(&released, generation);
                }
            });
            (subscription, pending, generation)
        };

        if let Some(pending) = pending {
            if let Err(error) = pending.await {
                log::warn!("subscribe to {channel} failed: {error}");
                subscription.unsubscribe();
                self.inner.abandon(&channel, generation, &error);
                return Err(error);
            }
            log::debug!("subscribed {channel}");
        }
        Ok(subscription)
    }

    /// Fires after a reconnect, once every channel with handlers has been
    /// re-subscribed.
    pub fn on_resynced(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.resynced.subscribe(move |_| callback())
    }

    pub async fn publish(
        &self,
        channel: &ChannelId,
        message: &ChannelMessage,
    ) -> Result<(), PublishError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(SessionError::Disposed.into());
        }
        self.inner.session.publish(channel, message.to_payload()).await
    }

    /// Channels with at least one handler.
    pub fn channel_count(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    pub fn handler_count(&self, channel: &ChannelId) -> usize {
        lock(&self.inner.channels)
            .get(channel)
            .map_or(0, |entry| entry.count)
    }

    /// Drop every handler and release every channel. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for subscription in lock(&self.inner.session_subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        let drained: Vec<(ChannelId, ChannelEntry)> =
            lock(&self.inner.channels).drain().collect();
        for (channel, entry) in drained {
            entry.handlers.close();
            self.inner.session.unsubscribe(&channel);
        }
        self.inner.resynced.close();
    }
}
