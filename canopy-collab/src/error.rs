//! Error taxonomy.
//!
//! Collaborator failures (identity provider, transport, record backend) are
//! translated into these types at the boundary that calls them. All errors
//! are `Clone` so one failure can be handed to every waiter and listener.

use std::time::Duration;

use canopy_core::ChannelId;
use thiserror::Error;

/// Failure reported by an [`IdentityProvider`](crate::auth::IdentityProvider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Sign-in, sign-out or token acquisition failed. Recoverable by another
/// `sign_in()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("identity provider rejected the request: {0}")]
    Provider(ProviderError),
    #[error("identity provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("no credential available")]
    NotAuthenticated,
    #[error("auth service disposed")]
    Disposed,
}

impl From<ProviderError> for AuthError {
    fn from(e: ProviderError) -> Self {
        AuthError::Provider(e)
    }
}

/// Unverified claim extraction failed. Never fatal: the token stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenFormatError {
    #[error("expected 3 dot-separated segments, found {0}")]
    SegmentCount(usize),
    #[error("claims segment is not base64url: {0}")]
    Base64(String),
    #[error("claims segment is not a JSON object: {0}")]
    Json(String),
}

/// Errors raised by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("credential rejected: {0}")]
    Unauthorized(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("channel {channel} rejected: {reason}")]
    Rejected { channel: String, reason: String },
}

/// The session could not be (re)established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportConnectError {
    #[error("connect attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport refused connection: {0}")]
    Refused(String),
    #[error("gave up after {attempts} connect attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("transport implementation failed to load: {0}")]
    Load(String),
}

/// Session-level failure, delivered to every waiter and subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] TransportConnectError),
    #[error("credential rejected {attempts} times in a row")]
    AuthRejected { attempts: u32 },
    #[error("no credential for session: {0}")]
    Auth(#[from] AuthError),
    #[error("session disposed")]
    Disposed,
}

/// Channel-level failure. Isolated to that channel's handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("session unavailable: {0}")]
    Session(#[from] SessionError),
    #[error("subscription to {channel} rejected: {reason}")]
    Rejected { channel: String, reason: String },
    #[error("subscription to {channel} not confirmed: {reason}")]
    Unavailable { channel: String, reason: String },
    #[error("undecodable message on {channel}: {reason}")]
    Decode { channel: String, reason: String },
    #[error("registry disposed")]
    Disposed,
}

impl SubscriptionError {
    /// `Rejected` when the server refused `channel`, `Unavailable` when
    /// the subscribe never got an answer.
    pub(crate) fn for_channel(channel: &ChannelId, error: &TransportError) -> Self {
        let channel = channel.to_string();
        match error {
            TransportError::Rejected { reason, .. } => SubscriptionError::Rejected {
                channel,
                reason: reason.clone(),
            },
            TransportError::Unauthorized(reason) => SubscriptionError::Rejected {
                channel,
                reason: reason.clone(),
            },
            other => SubscriptionError::Unavailable {
                channel,
                reason: other.to_string(),
            },
        }
    }
}

/// A publish did not reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("session unavailable: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A local mutation did not take. The optimistic value has been rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("invalid record reference: {0}")]
    InvalidRef(String),
    #[error("collection {0} is not open")]
    NotOpen(String),
    #[error("write to {record} rejected: {reason}")]
    Rejected { record: String, reason: String },
    #[error("write not acknowledged within {0:?}")]
    Timeout(Duration),
    #[error("record cache disposed")]
    Disposed,
}

/// A collection could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    #[error("invalid collection name: {0:?}")]
    InvalidCollection(String),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("snapshot failed: {0}")]
    Backend(#[from] BackendError),
    #[error("snapshot not received within {0:?}")]
    Timeout(Duration),
    #[error("record cache disposed")]
    Disposed,
}

/// Failure reported by a [`RecordBackend`](crate::cache::RecordBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
