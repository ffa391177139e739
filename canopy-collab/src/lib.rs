//! # canopy-collab: real-time collaboration engine for Canopy
//!
//! Authenticates a user, keeps one multiplexed pub/sub session to the
//! realtime service and exposes shared document state that updates as
//! remote changes arrive.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   token    ┌──────────────────┐   frames   ┌───────────┐
//! │ IdentityProvider │ ─────────► │ AuthService      │            │ realtime  │
//! └──────────────────┘  adapter   └────────┬─────────┘            │ server    │
//!                                          │ credential           └─────▲─────┘
//!                                          ▼                            │
//!                                 ┌──────────────────┐  Transport (ws)  │
//!                                 │ SessionManager   │ ◄────────────────┘
//!                                 │ (driver task)    │
//!                                 └────────┬─────────┘
//!                                          │ per-channel fan-out
//!                                          ▼
//!                                 ┌──────────────────┐
//!                                 │ ChannelRegistry  │
//!                                 └──┬──────┬─────┬──┘
//!                                    │      │     │
//!                      ┌─────────────┘      │     └──────────────┐
//!                      ▼                    ▼                    ▼
//!              ┌───────────────┐   ┌───────────────┐    ┌───────────────┐
//!              │ RecordCache   │   │ PresenceRoster│    │ ActivityFeed  │
//!              │ (+ backend)   │   └───────────────┘    └───────────────┘
//!              └───────────────┘
//! ```
//!
//! Components are built leaves first and handed to each other explicitly.
//!
//! ## Modules
//!
//! - [`auth`]: token parsing, provider boundary, auth state machine
//! - [`transport`]: transport trait and the WebSocket implementation
//! - [`session`]: connection lifecycle, reconnect and resubscription
//! - [`registry`]: reference-counted channel subscriptions
//! - [`cache`]: optimistic record cache over a [`cache::RecordBackend`]
//! - [`presence`], [`activity`]: document awareness views
//! - [`config`]: TOML configuration with defaults

pub mod activity;
pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod presence;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use activity::{relative_time, ActivityEntry, ActivityFeed};
pub use auth::{AuthService, AuthState, IdentityProvider, StaticTokenProvider, Token};
pub use broadcast::{Listeners, Subscription};
pub use cache::{
    CacheEvent, ChangeOrigin, CollectionView, PendingWrite, RecordBackend, RecordCache,
    RecordLookup, RecordSnapshot, RecordWrite, RemoteRecord, WriteAck,
};
pub use config::{AuthConfig, CacheConfig, CollabConfig, SessionConfig};
pub use error::{
    AuthError, BackendError, ConfigError, OpenError, ProviderError, PublishError, SessionError,
    SubscriptionError, TransportConnectError, TransportError, WriteError,
};
pub use presence::{PresenceChange, PresenceMember, PresenceRoster};
pub use registry::ChannelRegistry;
pub use session::{InboundMessage, LinkState, SessionEvent, SessionManager};
pub use transport::{Preloaded, Transport, TransportLoader, WsLoader, WsTransport};
