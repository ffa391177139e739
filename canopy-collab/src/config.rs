//! Client configuration.
//!
//! Every section has defaults, so an empty TOML document is a valid config:
//!
//! ```toml
//! server_url = "wss://collab.example.com/bayeux"
//!
//! [session]
//! connect_timeout_ms = 5000
//! max_connect_attempts = 3
//!
//! [cache]
//! refetch_on_resync = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Upper bound for sign-in, sign-out, token acquisition and verification.
    pub request_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
        }
    }
}

impl AuthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-attempt bound for a handshake.
    pub connect_timeout_ms: u64,
    /// Attempts per (re)connect before the failure is session-fatal.
    pub max_connect_attempts: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// Consecutive credential rejections tolerated before giving up.
    pub max_auth_retries: u32,
    /// Request the acknowledgement extension at handshake.
    pub ack_extension: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            max_connect_attempts: 5,
            reconnect_initial_backoff_ms: 250,
            reconnect_max_backoff_ms: 8_000,
            max_auth_retries: 3,
            ack_extension: true,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based): doubling, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .reconnect_initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.reconnect_max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub write_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,
    /// Re-fetch snapshots of loaded collections after a resync.
    pub refetch_on_resync: bool,
    /// Events kept by an activity feed.
    pub activity_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 10_000,
            snapshot_timeout_ms: 10_000,
            refetch_on_resync: true,
            activity_limit: 20,
        }
    }
}

impl CacheConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub server_url: String,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090/bayeux".to_string(),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl CollabConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(CollabConfig::from_toml_str("").unwrap(), CollabConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = CollabConfig::from_toml_str(
            r#"
            server_url = "wss://collab.example.com/bayeux"
            [session]
            max_connect_attempts = 2
            [cache]
            refetch_on_resync = false
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url, "wss://collab.example.com/bayeux");
        assert_eq!(config.session.max_connect_attempts, 2);
        assert_eq!(config.session.max_auth_retries, 3);
        assert!(!config.cache.refetch_on_resync);
        assert_eq!(config.auth, AuthConfig::default());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let session = SessionConfig {
            reconnect_initial_backoff_ms: 100,
            reconnect_max_backoff_ms: 500,
            ..SessionConfig::default()
        };
        assert_eq!(session.backoff(1), Duration::from_millis(100));
        assert_eq!(session.backoff(2), Duration::from_millis(200));
        assert_eq!(session.backoff(3), Duration::from_millis(400));
        assert_eq!(session.backoff(4), Duration::from_millis(500));
        assert_eq!(session.backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[auth]\nrequest_timeout_ms = 250").unwrap();
        let config = CollabConfig::load(file.path()).unwrap();
        assert_eq!(config.auth.request_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file_error_is_cloneable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = CollabConfig::load(&path).unwrap_err();
        match &err {
            ConfigError::Io { path: reported, .. } => {
                assert_eq!(*reported, path.display().to_string())
            }
            other => panic!("expected io error, got {other:?}"),
        }
        assert_eq!(err.clone(), err);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            CollabConfig::from_toml_str("session = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
