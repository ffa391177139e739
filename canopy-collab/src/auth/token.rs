//! Bearer tokens and their unverified claims.
//!
//! The token is opaque to the engine. Claims are read without verifying the
//! signature, for display and expiry hints only:
//!
//! ```text
//! header.payload.signature     (base64url segments)
//!        │
//!        ▼
//! {"sub": "...", "org": "...", "sid": "...", "exp": 1767225600, "jti": "..."}
//! ```

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::TokenFormatError;

/// Claims extracted from the middle segment. All optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub session_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub token_id: Option<String>,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(alias = "sub", alias = "uid", alias = "userId")]
    user_id: Option<String>,
    #[serde(alias = "org", alias = "oid", alias = "orgId")]
    org_id: Option<String>,
    #[serde(alias = "sid", alias = "sessionId")]
    session_id: Option<String>,
    exp: Option<i64>,
    jti: Option<String>,
}

impl TokenClaims {
    /// Decode the claims segment of `raw` without signature verification.
    pub fn decode(raw: &str) -> Result<Self, TokenFormatError> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(TokenFormatError::SegmentCount(segments.len()));
        }
        let payload = segments[1].trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| TokenFormatError::Base64(e.to_string()))?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| TokenFormatError::Json(e.to_string()))?;
        if !value.is_object() {
            return Err(TokenFormatError::Json("claims are not an object".into()));
        }
        let raw: RawClaims =
            serde_json::from_value(value).map_err(|e| TokenFormatError::Json(e.to_string()))?;

        Ok(Self {
            user_id: raw.user_id,
            org_id: raw.org_id,
            session_id: raw.session_id,
            expires_at: raw.exp.and_then(|s| Utc.timestamp_opt(s, 0).single()),
            token_id: raw.jti,
        })
    }
}

/// An opaque bearer credential.
///
/// Owned by the auth service; everyone else gets clones.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    raw: String,
    claims: Option<TokenClaims>,
}

impl Token {
    /// Wrap a raw credential. Malformed tokens are accepted with no claims.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let claims = match TokenClaims::decode(&raw) {
            Ok(claims) => Some(claims),
            Err(e) => {
                log::debug!("token claims unavailable: {e}");
                None
            }
        };
        Self { raw, claims }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn claims(&self) -> Option<&TokenClaims> {
        self.claims.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.claims.as_ref()?.user_id.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.claims.as_ref()?.expires_at
    }

    /// Whether the `exp` claim has passed (within `leeway`). Tokens without
    /// an expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        let leeway = chrono::Duration::from_std(leeway).unwrap_or_else(|_| chrono::Duration::zero());
        match self.expires_at() {
            Some(exp) => exp <= now + leeway,
            None => false,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("raw", &"<redacted>")
            .field("claims", &self.claims)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{body}.sig")
}
