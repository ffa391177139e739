//! Authentication lifecycle.
//!
//! ```text
//! IdentityProvider (external OAuth client)
//!       │  callbacks: signIn / signOut
//!       ▼
//! TokenLifecycleAdapter ── one listener per event kind
//!       │
//!       ▼
//! AuthService ── AuthState + Token, on_auth_state_change / on_token_change
//! ```

pub mod adapter;
pub mod provider;
pub mod service;
pub mod token;

pub use adapter::TokenLifecycleAdapter;
pub use provider::{
    IdentityProvider, ListenerId, ProviderEvent, ProviderEventKind, ProviderListener,
    StaticTokenProvider,
};
pub use service::{AuthService, AuthState};
pub use token::{Token, TokenClaims};
