use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Process-local refresh session store. Every operation runs under one lock,
/// which makes `rotate` trivially atomic.
pub struct InMemoryRefreshSessionStore {
    sessions: Mutex<HashMap<RefreshToken, RefreshSession>>,
    generator: Arc<dyn RefreshTokenGenerator>,
}

impl InMemoryRefreshSessionStore {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(OsRngTokenGenerator))
    }

    pub fn with_generator(generator: Arc<dyn RefreshTokenGenerator>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            generator,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }

    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<RefreshToken, RefreshSession>>, AuthError> {
        self.sessions
            .lock()
            .map_err(|e| AuthError::Internal(format!("session map poisoned: {e}")))
    }

    fn insert_new(
        &self,
        sessions: &mut HashMap<RefreshToken, RefreshSession>,
        principal_id: PrincipalId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RefreshSession, AuthError> {
        let expires_at = expiry_after(now, ttl)?;
        let token = self.generator.generate();
        if sessions.contains_key(&token) {
            return Err(token_collision(principal_id));
        }
        let session = RefreshSession {
            token: token.clone(),
            principal_id,
            issued_at: now,
            expires_at,
            revoked: false,
        };
        sessions.insert(token, session.clone());
        Ok(session)
    }
}

impl Default for InMemoryRefreshSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RefreshSessionStore for InMemoryRefreshSessionStore {
    async fn create(
        &self,
        principal_id: PrincipalId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RefreshSession, AuthError> {
        let mut sessions = self.sessions()?;
        self.insert_new(&mut sessions, principal_id, ttl, now)
    }

    async fn find_active(
        &self,
        token: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError> {
        let sessions = self.sessions()?;
        Ok(sessions.get(token).filter(|s| s.is_active(now)).cloned())
    }

    async fn lookup(&self, token: &RefreshToken) -> Result<Option<RefreshSession>, AuthError> {
        Ok(self.sessions()?.get(token).cloned())
    }

    async fn rotate(
        &self,
        token: &RefreshToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError> {
        let mut sessions = self.sessions()?;
        let principal_id = match sessions.get(token) {
            Some(current) if current.is_active(now) => current.principal_id,
            _ => return Ok(None),
        };

        // Insert first so a collision leaves the presented token untouched.
        let next = self.insert_new(&mut sessions, principal_id, ttl, now)?;
        if let Some(current) = sessions.get_mut(token) {
            current.revoked = true;
        }
        Ok(Some(next))
    }

    async fn revoke(&self, token: &RefreshToken) -> Result<(), AuthError> {
        if let Some(session) = self.sessions()?.get_mut(token) {
            session.revoked = true;
        }
        Ok(())
    }

    async fn revoke_all(&self, principal_id: PrincipalId) -> Result<u64, AuthError> {
        let mut sessions = self.sessions()?;
        let mut count = 0;
        for session in sessions
            .values_mut()
            .filter(|s| s.principal_id == principal_id && !s.revoked)
        {
            session.revoked = true;
            count += 1;
        }
        Ok(count)
    }

    async fn list_active(
        &self,
        principal_id: PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshSession>, AuthError> {
        let sessions = self.sessions()?;
        let mut active: Vec<RefreshSession> = sessions
            .values()
            .filter(|s| s.principal_id == principal_id && s.is_active(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(active)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut sessions = self.sessions()?;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_purgeable(now));
        Ok((before - sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    struct FixedGenerator;

    impl RefreshTokenGenerator for FixedGenerator {
        fn generate(&self) -> RefreshToken {
            RefreshToken("always-the-same".to_string())
        }
    }

    #[tokio::test]
    async fn created_session_is_found_until_it_expires() {
        let store = InMemoryRefreshSessionStore::new();
        let now = Utc::now();
        let principal = PrincipalId::new_random();

        let session = store.create(principal, HOUR, now).await.unwrap();
        assert_eq!(session.principal_id, principal);
        assert_eq!(session.expires_at, now + HOUR);

        let found = store.find_active(&session.token, now).await.unwrap();
        assert_eq!(found, Some(session.clone()));

        let later = now + HOUR;
        assert!(store.find_active(&session.token, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotated_token_is_never_accepted_again() {
        let store = InMemoryRefreshSessionStore::new();
        let now = Utc::now();
        let principal = PrincipalId::new_random();
        let first = store.create(principal, HOUR, now).await.unwrap();

        let second = store.rotate(&first.token, HOUR, now).await.unwrap().unwrap();
        assert_ne!(first.token, second.token);
        assert_eq!(second.principal_id, principal);

        assert!(store.find_active(&first.token, now).await.unwrap().is_none());
        assert!(store.rotate(&first.token, HOUR, now).await.unwrap().is_none());
        assert!(store.find_active(&second.token, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rotate_rejects_unknown_and_expired_tokens() {
        let store = InMemoryRefreshSessionStore::new();
        let now = Utc::now();
        let unknown = RefreshToken("nope".to_string());
        assert!(store.rotate(&unknown, HOUR, now).await.unwrap().is_none());

        let session = store
            .create(PrincipalId::new_random(), HOUR, now)
            .await
            .unwrap();
        let after_expiry = now + HOUR + Duration::from_secs(1);
        assert!(store.rotate(&session.token, HOUR, after_expiry).await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = InMemoryRefreshSessionStore::new();
        let now = Utc::now();
        let session = store
            .create(PrincipalId::new_random(), HOUR, now)
            .await
            .unwrap();

        store.revoke(&session.token).await.unwrap();
        store.revoke(&session.token).await.unwrap();
        store.revoke(&RefreshToken("missing".to_string())).await.unwrap();

        let record = store.lookup(&session.token).await.unwrap().unwrap();
        assert_eq!(record.state(now), SessionState::Revoked);
    }

    #[tokio::test]
    async fn revoke_all_only_touches_one_principal() {
        let store = InMemoryRefreshSessionStore::new();
        let now = Utc::now();
        let alice = PrincipalId::new_random();
        let bob = PrincipalId::new_random();
        let a1 = store.create(alice, HOUR, now).await.unwrap();
        let a2 = store.create(alice, HOUR, now).await.unwrap();
        let b1 = store.create(bob, HOUR, now).await.unwrap();

        assert_eq!(store.revoke_all(alice).await.unwrap(), 2);
        assert_eq!(store.revoke_all(alice).await.unwrap(), 0);

        assert!(store.find_active(&a1.token, now).await.unwrap().is_none());
        assert!(store.find_active(&a2.token, now).await.unwrap().is_none());
        assert!(store.find_active(&b1.token, now).await.unwrap().is_some());
        assert_eq!(store.list_active(bob, now).await.unwrap().len(), 1);
        assert!(store.list_active(alice, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_removes_all_and_only_dead_records() {
        let store = InMemoryRefreshSessionStore::new();
        let now = Utc::now();
        let principal = PrincipalId::new_random();

        let live = store.create(principal, HOUR, now).await.unwrap();
        let revoked = store.create(principal, HOUR, now).await.unwrap();
        store.revoke(&revoked.token).await.unwrap();
        let short = store
            .create(principal, Duration::from_secs(10), now)
            .await
            .unwrap();

        let sweep_at = now + Duration::from_secs(60);
        assert_eq!(store.purge_expired(sweep_at).await.unwrap(), 2);
        assert!(store.lookup(&revoked.token).await.unwrap().is_none());
        assert!(store.lookup(&short.token).await.unwrap().is_none());
        assert_eq!(store.find_active(&live.token, sweep_at).await.unwrap(), Some(live));
        assert_eq!(store.purge_expired(sweep_at).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn collision_is_fatal_and_leaves_existing_session_alone() {
        let store = InMemoryRefreshSessionStore::with_generator(Arc::new(FixedGenerator));
        let now = Utc::now();
        let principal = PrincipalId::new_random();
        let first = store.create(principal, HOUR, now).await.unwrap();

        let err = store.create(principal, HOUR, now).await.unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));

        let err = store.rotate(&first.token, HOUR, now).await.unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
        assert!(store.find_active(&first.token, now).await.unwrap().is_some());
    }
}
