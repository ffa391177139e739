//! Recent activity on a document, newest first.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use canopy_core::{ActivityEvent, ChannelMessage, DocumentRef};
use chrono::{DateTime, Utc};

use crate::broadcast::{lock, Listeners, Subscription};
use crate::error::SubscriptionError;
use crate::registry::ChannelRegistry;

#[derive(Debug, Clone, PartialEq)]
pub struct ActivityEntry {
    pub event: ActivityEvent,
    /// Human-relative age, e.g. "5 minutes ago".
    pub relative: String,
}

/// Format the age of `at` as seen from `now`.
///
/// Future timestamps (clock skew) read as "just now". Anything older than
/// a week is shown as a date.
pub fn relative_time(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(at).num_seconds();
    if secs < 60 {
        return "just now".to_string();
    }

    let minutes = secs / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    match (days, hours, minutes) {
        (0, 0, 1) => "1 minute ago".to_string(),
        (0, 0, m) => format!("{m} minutes ago"),
        (0, 1, _) => "1 hour ago".to_string(),
        (0, h, _) => format!("{h} hours ago"),
        (1, _, _) => "yesterday".to_string(),
        (d, _, _) if d < 7 => format!("{d} days ago"),
        _ => at.format("%b %-d, %Y").to_string(),
    }
}

struct FeedInner {
    limit: usize,
    events: Mutex<VecDeque<ActivityEvent>>,
    appended: Listeners<ActivityEvent>,
}

impl FeedInner {
    /// Insert by `created_at`, newest first. Returns false for duplicates
    /// and for events too old to make the cut.
    fn insert(&self, event: &ActivityEvent) -> bool {
        let mut events = lock(&self.events);
        if events.iter().any(|e| e.event_id == event.event_id) {
            return false;
        }
        let at = events
            .iter()
            .position(|e| e.created_at < event.created_at)
            .unwrap_or(events.len());
        if at >= self.limit {
            return false;
        }
        events.insert(at, event.clone());
        events.truncate(self.limit);
        true
    }
}

/// The latest `limit` activity events of a document.
pub struct ActivityFeed {
    document: DocumentRef,
    inner: Arc<FeedInner>,
    subscription: Subscription,
}

impl ActivityFeed {
    pub async fn watch(
        registry: ChannelRegistry,
        document: DocumentRef,
        limit: usize,
    ) -> Result<Self, SubscriptionError> {
        let inner = Arc::new(FeedInner {
            limit,
            events: Mutex::new(VecDeque::new()),
            appended: Listeners::new(),
        });
        let weak = Arc::downgrade(&inner);
        let subscription = registry
            .subscribe(document.activity_channel(), move |delivery| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match delivery {
                    Ok(ChannelMessage::Activity(event)) => {
                        if inner.insert(event) {
                            inner.appended.emit(event);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("activity channel for {document}: {e}"),
                }
            })
            .await?;
        Ok(Self {
            document,
            inner,
            subscription,
        })
    }

    pub fn document(&self) -> DocumentRef {
        self.document
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self, now: DateTime<Utc>) -> Vec<ActivityEntry> {
        lock(&self.inner.events)
            .iter()
            .map(|event| ActivityEntry {
                event: event.clone(),
                relative: relative_time(event.created_at, now),
            })
            .collect()
    }

    /// Fires for each event that enters the feed.
    pub fn on_event(&self, callback: impl Fn(&ActivityEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.appended.subscribe(callback)
    }

    pub fn close(&self) {
        self.subscription.unsubscribe();
        self.inner.appended.close();
    }
}

impl Drop for ActivityFeed {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthService;
    use crate::config::{AuthConfig, SessionConfig};
    use crate::session::SessionManager;
    use crate::testing::{eventually, MemoryTransport, ScriptedProvider};
    use chrono::{Duration as Age, TimeZone};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    fn event(id: &str, minutes_ago: i64) -> ActivityEvent {
        ActivityEvent {
            event_id: id.to_string(),
            message: format!("did {id}"),
            created_at: now() - Age::minutes(minutes_ago),
            actor: Some("bob".into()),
        }
    }

    #[test]
    fn test_relative_time() {
        let at = |age: Age| relative_time(now() - age, now());
        assert_eq!(at(Age::seconds(5)), "just now");
        assert_eq!(at(Age::seconds(-30)), "just now");
        assert_eq!(at(Age::seconds(90)), "1 minute ago");
        assert_eq!(at(Age::minutes(5)), "5 minutes ago");
        assert_eq!(at(Age::minutes(61)), "1 hour ago");
        assert_eq!(at(Age::hours(23)), "23 hours ago");
        assert_eq!(at(Age::hours(30)), "yesterday");
        assert_eq!(at(Age::days(3)), "3 days ago");
        assert_eq!(at(Age::days(10)), "Mar 4, 2026");
    }

    fn registry(transport: &Arc<MemoryTransport>) -> ChannelRegistry {
        let provider = Arc::new(ScriptedProvider::new(Some("tok")));
        let auth = AuthService::new(provider, &AuthConfig::default());
        let session = SessionManager::new("mem://", SessionConfig::default(), auth, transport.loader());
        ChannelRegistry::new(session)
    }

    #[tokio::test]
    async fn test_feed_orders_dedups_and_limits() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let feed = ActivityFeed::watch(registry(&transport), document, 2)
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(0usize));
        let s = seen.clone();
        let _sub = feed.on_event(move |_| *s.lock().unwrap() += 1);

        let channel = document.activity_channel();
        for e in [event("a", 10), event("b", 2), event("a", 10), event("c", 30), event("d", 0)] {
            assert!(transport.deliver(&channel, ChannelMessage::Activity(e).to_payload()));
        }
        assert!(eventually(Duration::from_secs(1), || *seen.lock().unwrap() == 3).await);

        let latest = feed.latest(now());
        let ids: Vec<&str> = latest.iter().map(|e| e.event.event_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b"]);
        assert_eq!(latest[0].relative, "just now");
        assert_eq!(latest[1].relative, "2 minutes ago");
    }

    #[tokio::test]
    async fn test_unbounded_limit_does_not_preallocate() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let feed = ActivityFeed::watch(registry(&transport), document, usize::MAX)
            .await
            .unwrap();

        let channel = document.activity_channel();
        assert!(transport.deliver(&channel, ChannelMessage::Activity(event("a", 1)).to_payload()));
        assert!(eventually(Duration::from_secs(1), || feed.latest(now()).len() == 1).await);
    }

    #[tokio::test]
    async fn test_drop_releases_channel() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let registry = registry(&transport);
        let feed = ActivityFeed::watch(registry.clone(), document, 5).await.unwrap();
        let channel = document.activity_channel();
        assert_eq!(registry.handler_count(&channel), 1);

        drop(feed);
        assert_eq!(registry.channel_count(), 0);
        assert!(eventually(Duration::from_secs(1), || transport.unsubscribes(&channel) == 1).await);
    }
}
