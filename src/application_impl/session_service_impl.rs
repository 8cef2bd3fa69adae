use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SessionTtl {
    pub access: Duration,
    pub refresh: Duration,
}

pub struct RealSessionService {
    principal_repo: Arc<dyn PrincipalRepo>,
    credential_hasher: Arc<dyn CredentialHasher>,
    credential_codec: Arc<dyn CredentialCodec>,
    session_store: Arc<dyn RefreshSessionStore>,
    clock: Arc<dyn Clock>,
    ttl: SessionTtl,
}

impl RealSessionService {
    pub fn new(
        principal_repo: Arc<dyn PrincipalRepo>,
        credential_hasher: Arc<dyn CredentialHasher>,
        credential_codec: Arc<dyn CredentialCodec>,
        session_store: Arc<dyn RefreshSessionStore>,
        clock: Arc<dyn Clock>,
        ttl: SessionTtl,
    ) -> Self {
        Self {
            principal_repo,
            credential_hasher,
            credential_codec,
            session_store,
            clock,
            ttl,
        }
    }

    fn pair(access: AccessCredential, refresh: RefreshSession) -> SessionPair {
        SessionPair {
            access_token: access.token,
            refresh_token: refresh.token,
            access_token_expires_at: access.expires_at,
            refresh_token_expires_at: refresh.expires_at,
        }
    }

    /// The caller only ever sees `InvalidToken`; the reason stays in the logs.
    async fn audit_rejected_refresh(&self, token: &RefreshToken) {
        let now = self.clock.now();
        match self.session_store.lookup(token).await {
            Ok(Some(session)) => {
                let state = session.state(now);
                if state == SessionState::Revoked {
                    warn!(
                        principal_id = %session.principal_id,
                        "refresh rejected: token already revoked, possible replay"
                    );
                } else {
                    info!(principal_id = %session.principal_id, %state, "refresh rejected");
                }
            }
            Ok(None) => info!("refresh rejected: unknown token"),
            Err(e) => debug!(error = %e, "refresh rejected: audit lookup failed"),
        }
    }
}

#[async_trait::async_trait]
impl SessionService for RealSessionService {
    async fn login(&self, request: LoginInput) -> Result<LoginResult, AuthError> {
        let LoginInput { username, password } = request;

        let rec = self
            .principal_repo
            .find_by_username(&username)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        let ok = self
            .credential_hasher
            .verify_password(&password, &rec.password_hash)
            .await?;
        if !ok {
            return Err(AuthError::Unauthenticated);
        }

        let principal = rec.principal;
        if !principal.is_active {
            info!(principal_id = %principal.id, "login refused: principal inactive");
            return Err(AuthError::Unauthenticated);
        }

        let now = self.clock.now();
        let refresh = self
            .session_store
            .create(principal.id, self.ttl.refresh, now)
            .await?;
        let access = self
            .credential_codec
            .issue(principal.id, principal.role, self.ttl.access)?;

        info!(principal_id = %principal.id, role = %principal.role, "login");

        Ok(LoginResult {
            principal,
            tokens: Self::pair(access, refresh),
        })
    }

    async fn validate(&self, access_token: &str) -> Result<AuthenticatedPrincipal, AuthError> {
        self.credential_codec
            .verify(&AccessToken(access_token.to_string()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<SessionPair, AuthError> {
        let presented = RefreshToken(refresh_token.to_string());
        let now = self.clock.now();

        // Everything that can fail transiently runs before the token is consumed.
        let Some(current) = self.session_store.find_active(&presented, now).await? else {
            self.audit_rejected_refresh(&presented).await;
            return Err(AuthError::InvalidToken);
        };

        let principal = match self.principal_repo.find_by_id(current.principal_id).await? {
            Some(principal) if principal.is_active => principal,
            _ => {
                warn!(
                    principal_id = %current.principal_id,
                    "refresh refused: principal inactive or gone, revoking all sessions"
                );
                self.logout_all(current.principal_id).await;
                return Err(AuthError::Forbidden);
            }
        };

        let access = self
            .credential_codec
            .issue(principal.id, principal.role, self.ttl.access)?;

        // The compare-and-set still decides between concurrent callers.
        let Some(next) = self
            .session_store
            .rotate(&presented, self.ttl.refresh, now)
            .await?
        else {
            self.audit_rejected_refresh(&presented).await;
            return Err(AuthError::InvalidToken);
        };

        debug!(principal_id = %principal.id, "refresh token rotated");

        Ok(Self::pair(access, next))
    }

    async fn logout(&self, refresh_token: &str) {
        let token = RefreshToken(refresh_token.to_string());
        if let Err(e) = self.session_store.revoke(&token).await {
            warn!(error = %e, "logout: revoking refresh session failed");
        }
    }

    async fn logout_all(&self, principal_id: PrincipalId) {
        match self.session_store.revoke_all(principal_id).await {
            Ok(count) => info!(%principal_id, count, "revoked all refresh sessions"),
            Err(e) => warn!(%principal_id, error = %e, "logout_all: revoking sessions failed"),
        }
    }

    async fn active_sessions(
        &self,
        principal_id: PrincipalId,
    ) -> Result<Vec<SessionSummary>, AuthError> {
        let sessions = self
            .session_store
            .list_active(principal_id, self.clock.now())
            .await?;
        Ok(sessions.iter().map(SessionSummary::from).collect())
    }
}
