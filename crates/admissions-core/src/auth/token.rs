//! Token pair and access token claims.
//!
//! Access tokens are decoded without verifying their signature. The claims
//! are only used to decide when to refresh and to show who is logged in; the
//! backend remains the authority on whether a token is valid.

use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access and refresh bearer tokens issued by the backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

// Tokens never end up in logs.
impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenDecodeError {
    #[error("Token is not in header.payload.signature form")]
    Malformed,

    #[error("Token payload is not valid base64url: {0}")]
    Base64(String),

    #[error("Token payload is not valid JSON: {0}")]
    Json(String),

    #[error("Token is missing the {0} claim")]
    MissingClaim(&'static str),
}

/// Claims decoded from an access token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub user_id: String,
    /// Expiry, seconds since the Unix epoch
    pub expires_at: i64,
    /// Issued-at, seconds since the Unix epoch
    pub issued_at: Option<i64>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub is_staff: bool,
    pub is_superuser: bool,
    pub roles: Vec<String>,
    /// Claims not mapped to a field above, kept verbatim.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClaimId {
    Number(i64),
    Text(String),
}

impl ClaimId {
    fn into_string(self) -> String {
        match self {
            ClaimId::Number(n) => n.to_string(),
            ClaimId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    user_id: Option<ClaimId>,
    sub: Option<ClaimId>,
    exp: Option<i64>,
    iat: Option<i64>,
    username: Option<String>,
    name: Option<String>,
    email: Option<String>,
    #[serde(default)]
    is_staff: bool,
    #[serde(default)]
    is_superuser: bool,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    /// Decode the payload segment of a JWT-shaped access token.
    pub fn decode(token: &str) -> Result<Self, TokenDecodeError> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
            _ => return Err(TokenDecodeError::Malformed),
        };

        // Some issuers keep the padding; accept both forms.
        let bytes = if payload.ends_with('=') {
            URL_SAFE.decode(payload)
        } else {
            URL_SAFE_NO_PAD.decode(payload)
        }
        .map_err(|e| TokenDecodeError::Base64(e.to_string()))?;

        let raw: RawClaims =
            serde_json::from_slice(&bytes).map_err(|e| TokenDecodeError::Json(e.to_string()))?;

        let user_id = raw
            .user_id
            .or(raw.sub)
            .map(ClaimId::into_string)
            .ok_or(TokenDecodeError::MissingClaim("user_id"))?;
        let expires_at = raw.exp.ok_or(TokenDecodeError::MissingClaim("exp"))?;

        Ok(Self {
            user_id,
            expires_at,
            issued_at: raw.iat,
            username: raw.username,
            name: raw.name,
            email: raw.email,
            is_staff: raw.is_staff,
            is_superuser: raw.is_superuser,
            roles: raw.roles,
            extra: raw.extra,
        })
    }

    /// True unless strictly more than `margin` remains before expiry.
    /// A token expiring exactly at `now` is expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self.expires_at.checked_sub(now.timestamp()) {
            Some(remaining) => remaining <= margin.num_seconds(),
            // Out-of-range expiry claims are treated as expired
            None => true,
        }
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    /// Clamped to the representable range for absurd expiry claims.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        let secs = self.expires_at.saturating_sub(now.timestamp());
        Duration::try_seconds(secs).unwrap_or(if secs > 0 { Duration::MAX } else { Duration::MIN })
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_until_expiry(now).num_minutes().max(0)
    }

    /// Best human-readable label for the logged-in user.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.username.as_deref())
            .or(self.email.as_deref())
            .unwrap_or(&self.user_id)
    }
}
