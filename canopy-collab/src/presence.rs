//! Presence roster for one document.
//!
//! Listens on the document's presence channel and keeps the set of remote
//! users currently there. Echoes of the local user's own announcements are
//! ignored.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use canopy_core::{ChannelMessage, DocumentRef, PresenceEvent, PresenceKind};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::broadcast::{lock, Listeners, Subscription};
use crate::error::{PublishError, SubscriptionError};
use crate::registry::ChannelRegistry;

/// A remote user seen on the document.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMember {
    pub user_id: String,
    pub joined_at: DateTime<Utc>,
    /// Name of the last custom signal, if any.
    pub last_signal: Option<String>,
    pub last_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Joined(PresenceMember),
    Left { user_id: String },
    Signal(PresenceMember),
}

struct RosterInner {
    document: DocumentRef,
    local_user: String,
    registry: ChannelRegistry,
    members: Mutex<BTreeMap<String, PresenceMember>>,
    changes: Listeners<PresenceChange>,
}

impl RosterInner {
    fn handle(&self, event: &PresenceEvent) {
        if event.user_id == self.local_user {
            return;
        }
        let change = {
            let mut members = lock(&self.members);
            match event.kind {
                PresenceKind::Arrived => {
                    if members.contains_key(&event.user_id) {
                        None
                    } else {
                        let member = PresenceMember {
                            user_id: event.user_id.clone(),
                            joined_at: Utc::now(),
                            last_signal: None,
                            last_data: None,
                        };
                        members.insert(event.user_id.clone(), member.clone());
                        Some(PresenceChange::Joined(member))
                    }
                }
                PresenceKind::Departed => members
                    .remove(&event.user_id)
                    .map(|member| PresenceChange::Left {
                        user_id: member.user_id,
                    }),
                PresenceKind::Custom => {
                    // A signal from someone we missed arriving counts as arrival.
                    let member = members
                        .entry(event.user_id.clone())
                        .or_insert_with(|| PresenceMember {
                            user_id: event.user_id.clone(),
                            joined_at: Utc::now(),
                            last_signal: None,
                            last_data: None,
                        });
                    member.last_signal = event.signal.clone();
                    member.last_data = event.data.clone();
                    Some(PresenceChange::Signal(member.clone()))
                }
                PresenceKind::Unknown => {
                    log::debug!("unknown presence kind from {}", event.user_id);
                    None
                }
            }
        };
        if let Some(change) = change {
            self.changes.emit(&change);
        }
    }
}

/// Live view of who is on a document.
pub struct PresenceRoster {
    inner: Arc<RosterInner>,
    subscription: Subscription,
}

impl PresenceRoster {
    pub async fn watch(
        registry: ChannelRegistry,
        document: DocumentRef,
        local_user: impl Into<String>,
    ) -> Result<Self, SubscriptionError> {
        let inner = Arc::new(RosterInner {
            document,
            local_user: local_user.into(),
            registry: registry.clone(),
            members: Mutex::new(BTreeMap::new()),
            changes: Listeners::new(),
        });
        let weak = Arc::downgrade(&inner);
        let subscription = registry
            .subscribe(document.presence_channel(), move |delivery| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match delivery {
                    Ok(ChannelMessage::Presence(event)) => inner.handle(event),
                    Ok(_) => {}
                    Err(e) => log::warn!("presence channel for {}: {e}", inner.document),
                }
            })
            .await?;
        Ok(Self {
            inner,
            subscription,
        })
    }

    pub fn document(&self) -> DocumentRef {
        self.inner.document
    }

    /// Remote users currently present, ordered by user id.
    pub fn present_users(&self) -> Vec<PresenceMember> {
        lock(&self.inner.members).values().cloned().collect()
    }

    pub fn is_present(&self, user_id: &str) -> bool {
        lock(&self.inner.members).contains_key(user_id)
    }

    pub fn on_change(&self, callback: impl Fn(&PresenceChange) + Send + Sync + 'static) -> Subscription {
        self.inner.changes.subscribe(callback)
    }

    /// Publish the local user's arrival or departure.
    pub async fn announce(&self, kind: PresenceKind) -> Result<(), PublishError> {
        let event = PresenceEvent {
            user_id: self.inner.local_user.clone(),
            kind,
            signal: None,
            data: None,
        };
        self.publish(event).await
    }

    /// Publish a custom signal from the local user.
    pub async fn signal(&self, name: &str, data: Option<Value>) -> Result<(), PublishError> {
        let event = PresenceEvent::custom(self.inner.local_user.clone(), name, data);
        self.publish(event).await
    }

    async fn publish(&self, event: PresenceEvent) -> Result<(), PublishError> {
        let channel = self.inner.document.presence_channel();
        self.inner
            .registry
            .publish(&channel, &ChannelMessage::Presence(event))
            .await
    }

    /// Stop listening. The roster keeps its last known members.
    pub fn close(&self) {
        self.subscription.unsubscribe();
        self.inner.changes.close();
    }
}

impl Drop for PresenceRoster {
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
    use crate::testing::{eventually, Call, MemoryTransport, ScriptedProvider};
    use serde_json::json;
    use std::time::Duration;

    fn registry(transport: &Arc<MemoryTransport>) -> ChannelRegistry {
        let provider = Arc::new(ScriptedProvider::new(Some("tok")));
        let auth = AuthService::new(provider, &AuthConfig::default());
        let session = SessionManager::new("mem://", SessionConfig::default(), auth, transport.loader());
        ChannelRegistry::new(session)
    }

    fn send(transport: &MemoryTransport, document: DocumentRef, event: PresenceEvent) {
        let data = ChannelMessage::Presence(event).to_payload();
        assert!(transport.deliver(&document.presence_channel(), data));
    }

    #[tokio::test]
    async fn test_roster_tracks_arrivals_and_departures() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let roster = PresenceRoster::watch(registry(&transport), document, "me")
            .await
            .unwrap();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        let _sub = roster.on_change(move |change| c.lock().unwrap().push(change.clone()));

        send(&transport, document, PresenceEvent::arrived("bob"));
        send(&transport, document, PresenceEvent::arrived("alice"));
        send(&transport, document, PresenceEvent::arrived("me"));
        send(&transport, document, PresenceEvent::departed("bob"));
        assert!(eventually(Duration::from_secs(1), || changes.lock().unwrap().len() == 3).await);

        let users: Vec<String> = roster.present_users().into_iter().map(|m| m.user_id).collect();
        assert_eq!(users, vec!["alice".to_string()]);
        assert!(!roster.is_present("me"));
        assert_eq!(
            changes.lock().unwrap()[2],
            PresenceChange::Left {
                user_id: "bob".into()
            }
        );
    }

    #[tokio::test]
    async fn test_custom_signal_recorded() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let roster = PresenceRoster::watch(registry(&transport), document, "me")
            .await
            .unwrap();

        send(
            &transport,
            document,
            PresenceEvent::custom("carol", "cursor", Some(json!({"x": 3}))),
        );
        assert!(eventually(Duration::from_secs(1), || roster.is_present("carol")).await);
        let carol = &roster.present_users()[0];
        assert_eq!(carol.last_signal.as_deref(), Some("cursor"));
        assert_eq!(carol.last_data, Some(json!({"x": 3})));
    }

    #[tokio::test]
    async fn test_announce_publishes_local_user() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let roster = PresenceRoster::watch(registry(&transport), document, "me")
            .await
            .unwrap();

        roster.announce(PresenceKind::Arrived).await.unwrap();
        let expected = ChannelMessage::Presence(PresenceEvent::arrived("me")).to_payload();
        assert!(transport
            .calls()
            .contains(&Call::Publish(document.presence_channel(), expected)));
    }

    #[tokio::test]
    async fn test_close_releases_channel() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let roster = PresenceRoster::watch(registry(&transport), document, "me")
            .await
            .unwrap();
        roster.close();
        let channel = document.presence_channel();
        assert!(eventually(Duration::from_secs(1), || transport.unsubscribes(&channel) == 1).await);
    }

    #[tokio::test]
    async fn test_drop_releases_channel() {
        let transport = MemoryTransport::new();
        let document = DocumentRef::random();
        let registry = registry(&transport);
        let roster = PresenceRoster::watch(registry.clone(), document, "me")
            .await
            .unwrap();
        let channel = document.presence_channel();
        assert_eq!(registry.handler_count(&channel), 1);

        drop(roster);
        assert_eq!(registry.channel_count(), 0);
        assert!(eventually(Duration::from_secs(1), || transport.unsubscribes(&channel) == 1).await);
    }
}
