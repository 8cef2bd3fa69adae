use super::PrincipalId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque refresh token. Never printed in full.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(pub String);

impl RefreshToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head: String = self.0.chars().take(6).collect();
        write!(f, "RefreshToken({head}…)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSession {
    pub token: RefreshToken,
    pub principal_id: PrincipalId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Revoked,
    Expired,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Active => "active",
            SessionState::Revoked => "revoked",
            SessionState::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl RefreshSession {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }

    /// Revocation wins over expiry when both apply.
    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        if self.revoked {
            SessionState::Revoked
        } else if self.expires_at > now {
            SessionState::Active
        } else {
            SessionState::Expired
        }
    }

    /// Records the sweeper is allowed to delete.
    pub fn is_purgeable(&self, now: DateTime<Utc>) -> bool {
        self.revoked || self.expires_at < now
    }
}

/// Client-facing view of a session; the token itself is never listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&RefreshSession> for SessionSummary {
    fn from(session: &RefreshSession) -> Self {
        SessionSummary {
            issued_at: session.issued_at,
            expires_at: session.expires_at,
        }
    }
}
