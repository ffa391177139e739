//! Token lifecycle adapter.
//!
//! Normalizes the provider's callback events into calls on the auth state
//! machine. Exactly one listener per event kind is registered on attach and
//! removed exactly once on detach.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::provider::{IdentityProvider, ListenerId, ProviderEvent, ProviderEventKind};
use super::token::Token;
use crate::broadcast::lock;
use crate::error::AuthError;

/// Receiver of provider-initiated changes. Implemented by the auth service;
/// these calls bypass the public `sign_in`/`sign_out` entry points.
pub(crate) trait AuthEventSink: Send + Sync {
    fn apply_external_sign_in(&self, token: Option<String>);
    fn apply_external_sign_out(&self);
}

pub struct TokenLifecycleAdapter {
    provider: Arc<dyn IdentityProvider>,
    registrations: Mutex<Option<Vec<(ProviderEventKind, ListenerId)>>>,
    timeout: Duration,
}

impl TokenLifecycleAdapter {
    pub(crate) fn attach(
        provider: Arc<dyn IdentityProvider>,
        sink: Weak<dyn AuthEventSink>,
        timeout: Duration,
    ) -> Self {
        let sign_in_sink = sink.clone();
        let sign_in = provider.add_listener(
            ProviderEventKind::SignIn,
            Arc::new(move |event: &ProviderEvent| {
                if let (ProviderEvent::SignedIn { token }, Some(sink)) = (event, sign_in_sink.upgrade()) {
                    sink.apply_external_sign_in(token.clone());
                }
            }),
        );
        let sign_out = provider.add_listener(
            ProviderEventKind::SignOut,
            Arc::new(move |event: &ProviderEvent| {
                if let (ProviderEvent::SignedOut, Some(sink)) = (event, sink.upgrade()) {
                    sink.apply_external_sign_out();
                }
            }),
        );

        Self {
            provider,
            registrations: Mutex::new(Some(vec![
                (ProviderEventKind::SignIn, sign_in),
                (ProviderEventKind::SignOut, sign_out),
            ])),
            timeout,
        }
    }

    /// Remove the provider listeners. Returns `false` if already detached.
    pub fn detach(&self) -> bool {
        let registrations = lock(&self.registrations).take();
        match registrations {
            Some(registrations) => {
                for (kind, id) in registrations {
                    self.provider.remove_listener(kind, id);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.registrations).is_some()
    }

    pub fn token_or_none(&self) -> Option<Token> {
        self.provider.token_or_none().map(Token::new)
    }

    pub async fn get_token(&self) -> Result<Option<Token>, AuthError> {
        let raw = self.bounded(self.provider.get_token()).await?;
        Ok(raw.map(Token::new))
    }

    pub async fn sign_in(&self) -> Result<Token, AuthError> {
        self.bounded(self.provider.sign_in()).await.map(Token::new)
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.bounded(self.provider.sign_out()).await
    }

    pub async fn verify(&self, token: &Token) -> Result<(), AuthError> {
        self.bounded(self.provider.verify(token.as_str())).await
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, crate::error::ProviderError>>,
    ) -> Result<T, AuthError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(AuthError::from),
            Err(_) => Err(AuthError::Timeout(self.timeout)),
        }
    }
}

impl Drop for TokenLifecycleAdapter {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        sign_ins: AtomicUsize,
        sign_outs: AtomicUsize,
    }

    impl AuthEventSink for CountingSink {
        fn apply_external_sign_in(&self, _token: Option<String>) {
            self.sign_ins.fetch_add(1, Ordering::SeqCst);
        }
        fn apply_external_sign_out(&self) {
            self.sign_outs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_registers_once_and_detaches_once() {
        let provider = Arc::new(StaticTokenProvider::new("t", false));
        let sink = Arc::new(CountingSink::default());
        let weak: Weak<dyn AuthEventSink> = Arc::downgrade(&sink) as Weak<dyn AuthEventSink>;
        let adapter = TokenLifecycleAdapter::attach(provider.clone(), weak, Duration::from_secs(1));
        assert_eq!(provider.listener_count(), 2);

        provider.sign_in().await.unwrap();
        provider.sign_out().await.unwrap();
        assert_eq!(sink.sign_ins.load(Ordering::SeqCst), 1);
        assert_eq!(sink.sign_outs.load(Ordering::SeqCst), 1);

        assert!(adapter.detach());
        assert!(!adapter.detach());
        assert_eq!(provider.listener_count(), 0);

        provider.sign_in().await.unwrap();
        assert_eq!(sink.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_sink_is_ignored() {
        let provider = Arc::new(StaticTokenProvider::new("t", false));
        let sink = Arc::new(CountingSink::default());
        let weak: Weak<dyn AuthEventSink> = Arc::downgrade(&sink) as Weak<dyn AuthEventSink>;
        let adapter = TokenLifecycleAdapter::attach(provider.clone(), weak, Duration::from_secs(1));
        drop(sink);
        // No panic, no delivery.
        assert_eq!(adapter.sign_in().await.unwrap().as_str(), "t");
        drop(adapter);
        assert_eq!(provider.listener_count(), 0);
    }
}
