//! Auth state machine.
//!
//! ```text
//!                 sign_in()                provider ok
//! Unauthenticated ─────────► Authenticating ───────────► Authenticated
//!       ▲   Error ──────────────┘   │                        │   │
//!       │     ▲        provider err │                        │   │ sign_out() ok
//!       │     └─────────────────────┘◄───── sign_out() err ──┘   │
//!       └────────────────────────────────────────────────────────┘
//!
//! external "signed in"  : any state            → Authenticated
//! external "signed out" : Authenticated | Error → Unauthenticated
//! ```
//!
//! The service owns the canonical state and token. Listeners are called
//! synchronously, state first, then token; both values are already updated
//! when either listener runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use super::adapter::{AuthEventSink, TokenLifecycleAdapter};
use super::provider::IdentityProvider;
use super::token::Token;
use crate::broadcast::{lock, Listeners, Subscription};
use crate::config::AuthConfig;
use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Error,
}

struct Core {
    state: AuthState,
    token: Option<Token>,
    validated: bool,
    last_error: Option<AuthError>,
}

struct AuthInner {
    core: Mutex<Core>,
    adapter: TokenLifecycleAdapter,
    state_listeners: Listeners<AuthState>,
    token_listeners: Listeners<Option<Token>>,
    /// Mirrors `core.state` for async waiters.
    progress: watch::Sender<AuthState>,
    disposed: AtomicBool,
}

impl AuthInner {
    /// Mutate the core under the lock, then notify outside it.
    fn update<R>(&self, mutate: impl FnOnce(&mut Core) -> R) -> R {
        let (result, state_changed, token_changed) = {
            let mut core = lock(&self.core);
            let state_before = core.state;
            let token_before = core.token.clone();
            let result = mutate(&mut core);
            let token_changed = core.token != token_before;
            if token_changed {
                core.validated = false;
            }
            (
                result,
                (core.state != state_before).then_some(core.state),
                token_changed.then(|| core.token.clone()),
            )
        };

        if self.disposed.load(Ordering::Acquire) {
            return result;
        }
        if let Some(state) = state_changed {
            log::debug!("auth state -> {state:?}");
            self.progress.send_replace(state);
            self.state_listeners.emit(&state);
        }
        if let Some(token) = token_changed {
            self.token_listeners.emit(&token);
        }
        result
    }
}

impl AuthEventSink for AuthInner {
    fn apply_external_sign_in(&self, token: Option<String>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let token = token.map(Token::new).or_else(|| self.adapter.token_or_none());
        log::info!("signed in by identity provider");
        self.update(|core| {
            core.state = AuthState::Authenticated;
            core.last_error = None;
            if token.is_some() {
                core.token = token;
            }
        });
    }

    fn apply_external_sign_out(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        log::info!("signed out by identity provider");
        self.update(|core| {
            core.token = None;
            if matches!(core.state, AuthState::Authenticated | AuthState::Error) {
                core.state = AuthState::Unauthenticated;
            }
        });
    }
}

/// Owner of the credential. Cheap to clone; clones share one state machine.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<AuthInner>,
}

impl AuthService {
    /// Attach to `provider`. The initial state is `Authenticated` if the
    /// provider already holds a token.
    pub fn new(provider: Arc<dyn IdentityProvider>, config: &AuthConfig) -> Self {
        let timeout = config.request_timeout();
        let inner = Arc::new_cyclic(|weak: &Weak<AuthInner>| {
            let sink: Weak<dyn AuthEventSink> = weak.clone();
            let adapter = TokenLifecycleAdapter::attach(provider, sink, timeout);
            let token = adapter.token_or_none();
            let state = if token.is_some() {
                AuthState::Authenticated
            } else {
                AuthState::Unauthenticated
            };
            AuthInner {
                core: Mutex::new(Core {
                    state,
                    token,
                    validated: false,
                    last_error: None,
                }),
                adapter,
                state_listeners: Listeners::new(),
                token_listeners: Listeners::new(),
                progress: watch::channel(state).0,
                disposed: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    pub fn current_state(&self) -> AuthState {
        lock(&self.inner.core).state
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_state() == AuthState::Authenticated
    }

    /// True only after [`AuthService::validate`] succeeded for the current token.
    pub fn is_validated(&self) -> bool {
        lock(&self.inner.core).validated
    }

    /// The error that put the machine into `Error`, if any.
    pub fn last_error(&self) -> Option<AuthError> {
        lock(&self.inner.core).last_error.clone()
    }

    /// Last known token. Never suspends.
    pub fn token_or_none(&self) -> Option<Token> {
        lock(&self.inner.core).token.clone()
    }

    /// A usable token, waiting for an in-flight sign-in or asking the
    /// provider when none is cached.
    pub async fn get_token(&self) -> Result<Token, AuthError> {
        self.ensure_live()?;
        if let Some(token) = self.token_or_none() {
            return Ok(token);
        }
        if self.current_state() == AuthState::Authenticating {
            return self.wait_for_outcome().await;
        }
        match self.inner.adapter.get_token().await? {
            Some(token) => {
                self.inner.apply_external_sign_in(Some(token.as_str().to_string()));
                Ok(token)
            }
            None => Err(AuthError::NotAuthenticated),
        }
    }

    /// Ask the provider for a fresh token, e.g. after the server rejected
    /// the cached one.
    pub async fn refresh_token(&self) -> Result<Token, AuthError> {
        self.ensure_live()?;
        match self.inner.adapter.get_token().await? {
            Some(token) => {
                let fresh = token.clone();
                self.inner.update(|core| {
                    core.token = Some(fresh);
                    core.state = AuthState::Authenticated;
                    core.last_error = None;
                });
                Ok(token)
            }
            None => {
                self.inner.apply_external_sign_out();
                Err(AuthError::NotAuthenticated)
            }
        }
    }

    pub async fn sign_in(&self) -> Result<Token, AuthError> {
        self.ensure_live()?;

        enum Plan {
            Start,
            Wait,
            Done(Token),
        }
        let plan = self.inner.update(|core| match (core.state, &core.token) {
            (AuthState::Authenticated, Some(token)) => Plan::Done(token.clone()),
            (AuthState::Authenticating, _) => Plan::Wait,
            _ => {
                core.state = AuthState::Authenticating;
                core.last_error = None;
                Plan::Start
            }
        });

        match plan {
            Plan::Done(token) => Ok(token),
            Plan::Wait => self.wait_for_outcome().await,
            Plan::Start => match self.inner.adapter.sign_in().await {
                Ok(token) => {
                    let stored = token.clone();
                    self.inner.update(|core| {
                        core.state = AuthState::Authenticated;
                        core.token = Some(stored);
                    });
                    log::info!(
                        "signed in as {}",
                        token.user_id().unwrap_or("<unknown user>")
                    );
                    Ok(token)
                }
                Err(e) => {
                    log::warn!("sign-in failed: {e}");
                    self.fail(e.clone());
                    Err(e)
                }
            },
        }
    }

    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.ensure_live()?;
        lock(&self.inner.core).validated = false;

        match self.inner.adapter.sign_out().await {
            Ok(()) => {
                self.inner.update(|core| {
                    core.state = AuthState::Unauthenticated;
                    core.token = None;
                    core.last_error = None;
                });
                log::info!("signed out");
                Ok(())
            }
            Err(e) => {
                log::warn!("sign-out failed: {e}");
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Verification round trip for the current token.
    pub async fn validate(&self) -> Result<(), AuthError> {
        self.ensure_live()?;
        let token = self.token_or_none().ok_or(AuthError::NotAuthenticated)?;
        self.inner.adapter.verify(&token).await?;
        let mut core = lock(&self.inner.core);
        if core.token.as_ref() == Some(&token) {
            core.validated = true;
        }
        Ok(())
    }

    pub fn on_auth_state_change(
        &self,
        callback: impl Fn(AuthState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.state_listeners.subscribe(move |state| callback(*state))
    }

    /// `None` is delivered when the token is cleared.
    pub fn on_token_change(
        &self,
        callback: impl Fn(Option<&Token>) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner
            .token_listeners
            .subscribe(move |token: &Option<Token>| callback(token.as_ref()))
    }

    /// Detach from the provider and silence all listeners. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.adapter.detach();
        self.inner.state_listeners.close();
        self.inner.token_listeners.close();
        // Wake waiters so they observe the disposal.
        self.inner.progress.send_modify(|_| {});
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), AuthError> {
        if self.is_disposed() {
            Err(AuthError::Disposed)
        } else {
            Ok(())
        }
    }

    fn fail(&self, error: AuthError) {
        self.inner.update(|core| {
            core.state = AuthState::Error;
            core.token = None;
            core.last_error = Some(error);
        });
    }

    async fn wait_for_outcome(&self) -> Result<Token, AuthError> {
        let mut rx = self.inner.progress.subscribe();
        loop {
            if self.is_disposed() {
                return Err(AuthError::Disposed);
            }
            let state = *rx.borrow_and_update();
            match state {
                AuthState::Authenticating => {
                    if rx.changed().await.is_err() {
                        return Err(AuthError::Disposed);
                    }
                }
                AuthState::Authenticated => {
                    return self.token_or_none().ok_or(AuthError::NotAuthenticated)
                }
                AuthState::Error => {
                    return Err(self.last_error().unwrap_or(AuthError::NotAuthenticated))
                }
                AuthState::Unauthenticated => return Err(AuthError::NotAuthenticated),
            }
        }
    }
}
