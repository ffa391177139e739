//! Identity provider boundary.
//!
//! The engine talks to an OAuth-style client through [`IdentityProvider`].
//! Provider implementations keep their own callback registry; the
//! [`TokenLifecycleAdapter`](super::TokenLifecycleAdapter) is the only
//! component that registers on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use super::token::Token;
use crate::broadcast::lock;
use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
    SignIn,
    SignOut,
}

/// Provider-initiated change, e.g. a sign-in completed in another tab or a
/// session revoked by the identity server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SignedIn { token: Option<String> },
    SignedOut,
}

impl ProviderEvent {
    pub fn kind(&self) -> ProviderEventKind {
        match self {
            ProviderEvent::SignedIn { .. } => ProviderEventKind::SignIn,
            ProviderEvent::SignedOut => ProviderEventKind::SignOut,
        }
    }
}

pub type ProviderListener = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// An external OAuth-style client.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Last known token. Must not block.
    fn token_or_none(&self) -> Option<String>;

    /// Current token, refreshing with the identity server when needed.
    /// `Ok(None)` means nobody is signed in.
    async fn get_token(&self) -> Result<Option<String>, ProviderError>;

    /// Interactive or silent sign-in. Resolves to the new token.
    async fn sign_in(&self) -> Result<String, ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;

    /// Verification round trip for `token`.
    async fn verify(&self, token: &str) -> Result<(), ProviderError>;

    fn add_listener(&self, kind: ProviderEventKind, listener: ProviderListener) -> ListenerId;

    fn remove_listener(&self, kind: ProviderEventKind, id: ListenerId);
}

/// Provider for service credentials: a fixed token issued out of band.
///
/// `sign_in` always yields the configured token, `sign_out` forgets it until
/// the next sign-in, and verification only checks the `exp` claim.
pub struct StaticTokenProvider {
    issued: String,
    current: Mutex<Option<String>>,
    listeners: Mutex<Vec<(ListenerId, ProviderEventKind, ProviderListener)>>,
    next_id: AtomicU64,
}

impl StaticTokenProvider {
    /// `signed_in` controls whether the token is already active.
    pub fn new(token: impl Into<String>, signed_in: bool) -> Self {
        let issued = token.into();
        Self {
            current: Mutex::new(signed_in.then(|| issued.clone())),
            issued,
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
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

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    fn token_or_none(&self) -> Option<String> {
        lock(&self.current).clone()
    }

    async fn get_token(&self) -> Result<Option<String>, ProviderError> {
        Ok(self.token_or_none())
    }

    async fn sign_in(&self) -> Result<String, ProviderError> {
        *lock(&self.current) = Some(self.issued.clone());
        self.fire(ProviderEvent::SignedIn {
            token: Some(self.issued.clone()),
        });
        Ok(self.issued.clone())
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        *lock(&self.current) = None;
        self.fire(ProviderEvent::SignedOut);
        Ok(())
    }

    async fn verify(&self, token: &str) -> Result<(), ProviderError> {
        if token != self.issued {
            return Err(ProviderError::new("unknown token"));
        }
        if Token::new(token).is_expired(Utc::now(), std::time::Duration::ZERO) {
            return Err(ProviderError::new("token expired"));
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_lifecycle() {
        let provider = StaticTokenProvider::new("svc-token", false);
        assert!(provider.token_or_none().is_none());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let id = provider.add_listener(
            ProviderEventKind::SignIn,
            Arc::new(move |e| s.lock().unwrap().push(e.clone())),
        );

        assert_eq!(provider.sign_in().await.unwrap(), "svc-token");
        assert_eq!(provider.get_token().await.unwrap().as_deref(), Some("svc-token"));
        provider.verify("svc-token").await.unwrap();
        assert!(provider.verify("other").await.is_err());

        provider.remove_listener(ProviderEventKind::SignIn, id);
        provider.sign_out().await.unwrap();
        provider.sign_in().await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(provider.listener_count(), 0);
    }
}
