use crate::domain_model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    /// Unknown, revoked and expired tokens all land here.
    #[error("token invalid")]
    InvalidToken,
    #[error("forbidden")]
    Forbidden,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(pub String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head: String = self.0.chars().take(8).collect();
        write!(f, "AccessToken({head}…)")
    }
}

#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub token: AccessToken,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPair {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LoginInput {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LoginInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginInput")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub principal: Principal,
    pub tokens: SessionPair,
}

/// Signs and checks access credentials. Pure: no I/O, safe to call on every request.
pub trait CredentialCodec: Send + Sync {
    fn issue(
        &self,
        principal_id: PrincipalId,
        role: Role,
        ttl: Duration,
    ) -> Result<AccessCredential, AuthError>;

    fn verify(&self, token: &AccessToken) -> Result<AuthenticatedPrincipal, AuthError>;
}

#[async_trait::async_trait]
pub trait CredentialHasher: Send + Sync {
    async fn hash_password(&self, password: &str) -> Result<String, AuthError>;
    async fn verify_password(&self, password: &str, password_hash: &str)
    -> Result<bool, AuthError>;
}

#[async_trait::async_trait]
pub trait SessionService: Send + Sync {
    async fn login(&self, request: LoginInput) -> Result<LoginResult, AuthError>;

    async fn validate(&self, access_token: &str) -> Result<AuthenticatedPrincipal, AuthError>;

    /// Consumes the presented token and hands back a fresh pair.
    async fn refresh(&self, refresh_token: &str) -> Result<SessionPair, AuthError>;

    /// Never fails for the caller; storage errors are logged.
    async fn logout(&self, refresh_token: &str);

    /// Never fails for the caller; storage errors are logged.
    async fn logout_all(&self, principal_id: PrincipalId);

    async fn active_sessions(
        &self,
        principal_id: PrincipalId,
    ) -> Result<Vec<SessionSummary>, AuthError>;
}
