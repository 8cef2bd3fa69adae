use crate::application_port::*;
use crate::domain_model::*;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use std::time::Duration;

/// 256 bits of entropy per refresh token.
pub const REFRESH_TOKEN_BYTES: usize = 32;

pub trait RefreshTokenGenerator: Send + Sync {
    fn generate(&self) -> RefreshToken;
}

#[derive(Debug, Default)]
pub struct OsRngTokenGenerator;

impl RefreshTokenGenerator for OsRngTokenGenerator {
    fn generate(&self) -> RefreshToken {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        RefreshToken(hex::encode(bytes))
    }
}

/// Error returned when a freshly generated token already exists.
/// Never retried: a repeat means the random source is broken.
pub fn token_collision(principal_id: PrincipalId) -> AuthError {
    tracing::error!(%principal_id, "refresh token collision, random source is suspect");
    AuthError::Internal("refresh token collision".to_string())
}

/// `start + ttl`, or `Internal` when the result leaves chrono's range.
pub fn expiry_after(start: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, AuthError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .ok_or_else(|| AuthError::Internal(format!("ttl out of range: {ttl:?}")))
}

#[async_trait::async_trait]
pub trait RefreshSessionStore: Send + Sync {
    async fn create(
        &self,
        principal_id: PrincipalId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RefreshSession, AuthError>;

    /// Only returns records that are not revoked and not yet expired.
    async fn find_active(
        &self,
        token: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError>;

    /// Raw record in whatever state it is in. Audit use only.
    async fn lookup(&self, token: &RefreshToken) -> Result<Option<RefreshSession>, AuthError>;

    /// Revoke `token` if and only if it is active, and create its replacement
    /// for the same principal in the same atomic step.
    /// `None` when the token was unknown, revoked or expired.
    async fn rotate(
        &self,
        token: &RefreshToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError>;

    /// Idempotent.
    async fn revoke(&self, token: &RefreshToken) -> Result<(), AuthError>;

    /// Idempotent. Returns how many active sessions were revoked.
    async fn revoke_all(&self, principal_id: PrincipalId) -> Result<u64, AuthError>;

    async fn list_active(
        &self,
        principal_id: PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshSession>, AuthError>;

    /// Delete every record that is revoked or expired before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;
}
