use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const REFRESH_CREATE: &str = include_str!("refresh_create.lua");
const REFRESH_ROTATE: &str = include_str!("refresh_rotate.lua");
const REFRESH_REVOKE: &str = include_str!("refresh_revoke.lua");
const REFRESH_REVOKE_ALL: &str = include_str!("refresh_revoke_all.lua");
const REFRESH_PURGE: &str = include_str!("refresh_purge.lua");

const PURGE_BATCH: usize = 500;

/// Layout under `prefix`:
/// - `{prefix}:session:{token}` hash with principal_id, issued_at, expires_at (ms), revoked
/// - `{prefix}:principal:{id}` set of that principal's tokens
/// - `{prefix}:expiry` sorted set scored by expiry ms, or 0 once revoked
///
/// `revoke_all` and `purge_expired` derive session keys inside Lua, so the
/// store needs a single Redis node or a primary with replicas, not Cluster.
pub struct RedisRefreshSessionStore {
    conn: ConnectionManager,
    prefix: String,
    generator: Arc<dyn RefreshTokenGenerator>,
    create_script: Script,
    rotate_script: Script,
    revoke_script: Script,
    revoke_all_script: Script,
    purge_script: Script,
}

fn store_err(e: redis::RedisError) -> AuthError {
    AuthError::Internal(format!("redis: {e}"))
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>, AuthError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AuthError::Internal(format!("redis: timestamp out of range: {ms}")))
}

/// Redis keeps millisecond precision; trim so returned records match stored ones.
fn truncate_ms(at: DateTime<Utc>) -> Result<DateTime<Utc>, AuthError> {
    from_ms(to_ms(at))
}

fn rotate_outcome(status: i64, next: RefreshSession) -> Result<Option<RefreshSession>, AuthError> {
    match status {
        1 => Ok(Some(next)),
        0 => Ok(None),
        -1 => Err(token_collision(next.principal_id)),
        other => Err(AuthError::Internal(format!(
            "redis: unknown rotate status {other}"
        ))),
    }
}

impl RedisRefreshSessionStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        RedisRefreshSessionStore {
            conn,
            prefix: prefix.into(),
            generator: Arc::new(OsRngTokenGenerator),
            create_script: Script::new(REFRESH_CREATE),
            rotate_script: Script::new(REFRESH_ROTATE),
            revoke_script: Script::new(REFRESH_REVOKE),
            revoke_all_script: Script::new(REFRESH_REVOKE_ALL),
            purge_script: Script::new(REFRESH_PURGE),
        }
    }

    fn session_prefix(&self) -> String {
        format!("{}:session:", self.prefix)
    }

    fn principal_prefix(&self) -> String {
        format!("{}:principal:", self.prefix)
    }

    fn session_key(&self, token: &RefreshToken) -> String {
        format!("{}{}", self.session_prefix(), token.as_str())
    }

    fn principal_key(&self, principal_id: PrincipalId) -> String {
        format!("{}{}", self.principal_prefix(), principal_id)
    }

    fn expiry_key(&self) -> String {
        format!("{}:expiry", self.prefix)
    }

    fn parse_session(
        token: &RefreshToken,
        fields: &HashMap<String, String>,
    ) -> Result<Option<RefreshSession>, AuthError> {
        if fields.is_empty() {
            return Ok(None);
        }
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| AuthError::Internal(format!("redis: session missing {name}")))
        };
        let parse_ms = |name: &str| -> Result<DateTime<Utc>, AuthError> {
            let ms = field(name)?
                .parse::<i64>()
                .map_err(|e| AuthError::Internal(format!("redis: bad {name}: {e}")))?;
            from_ms(ms)
        };

        let principal_id = field("principal_id")?
            .parse::<PrincipalId>()
            .map_err(|e| AuthError::Internal(format!("redis: bad principal_id: {e}")))?;

        Ok(Some(RefreshSession {
            token: token.clone(),
            principal_id,
            issued_at: parse_ms("issued_at")?,
            expires_at: parse_ms("expires_at")?,
            revoked: field("revoked")? != "0",
        }))
    }
}

#[async_trait::async_trait]
impl RefreshSessionStore for RedisRefreshSessionStore {
    async fn create(
        &self,
        principal_id: PrincipalId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RefreshSession, AuthError> {
        let issued_at = truncate_ms(now)?;
        let session = RefreshSession {
            token: self.generator.generate(),
            principal_id,
            issued_at,
            expires_at: expiry_after(issued_at, ttl)?,
            revoked: false,
        };

        let mut conn = self.conn.clone();
        let created: i64 = self
            .create_script
            .key(self.session_key(&session.token))
            .key(self.principal_key(principal_id))
            .key(self.expiry_key())
            .arg(session.token.as_str())
            .arg(principal_id.to_string())
            .arg(to_ms(session.issued_at))
            .arg(to_ms(session.expires_at))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        if created != 1 {
            return Err(token_collision(principal_id));
        }
        Ok(session)
    }

    async fn find_active(
        &self,
        token: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError> {
        Ok(self.lookup(token).await?.filter(|s| s.is_active(now)))
    }

    async fn lookup(&self, token: &RefreshToken) -> Result<Option<RefreshSession>, AuthError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.session_key(token))
            .await
            .map_err(store_err)?;
        Self::parse_session(token, &fields)
    }

    async fn rotate(
        &self,
        token: &RefreshToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError> {
        let issued_at = truncate_ms(now)?;
        let expires_at = expiry_after(issued_at, ttl)?;

        let mut conn = self.conn.clone();
        // Read the owner first so the script can name every key it touches.
        // The script re-checks it, so a concurrent change only yields `None`.
        let owner: Option<String> = conn
            .hget(self.session_key(token), "principal_id")
            .await
            .map_err(store_err)?;
        let Some(owner) = owner else {
            return Ok(None);
        };
        let principal_id = owner
            .parse::<PrincipalId>()
            .map_err(|e| AuthError::Internal(format!("redis: bad principal_id: {e}")))?;

        let next = RefreshSession {
            token: self.generator.generate(),
            principal_id,
            issued_at,
            expires_at,
            revoked: false,
        };
        let status: i64 = self
            .rotate_script
            .key(self.session_key(token))
            .key(self.session_key(&next.token))
            .key(self.expiry_key())
            .key(self.principal_key(principal_id))
            .arg(token.as_str())
            .arg(next.token.as_str())
            .arg(to_ms(issued_at))
            .arg(to_ms(expires_at))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        rotate_outcome(status, next)
    }

    async fn revoke(&self, token: &RefreshToken) -> Result<(), AuthError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .revoke_script
            .key(self.session_key(token))
            .key(self.expiry_key())
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn revoke_all(&self, principal_id: PrincipalId) -> Result<u64, AuthError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .revoke_all_script
            .key(self.principal_key(principal_id))
            .key(self.expiry_key())
            .arg(self.session_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(count)
    }

    async fn list_active(
        &self,
        principal_id: PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshSession>, AuthError> {
        let mut conn = self.conn.clone();
        let tokens: Vec<String> = conn
            .smembers(self.principal_key(principal_id))
            .await
            .map_err(store_err)?;
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let tokens: Vec<RefreshToken> = tokens.into_iter().map(RefreshToken).collect();
        let mut pipe = redis::pipe();
        for token in &tokens {
            pipe.hgetall(self.session_key(token));
        }
        let rows: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(store_err)?;

        let mut active = Vec::with_capacity(tokens.len());
        for (token, fields) in tokens.iter().zip(rows.iter()) {
            if let Some(session) = Self::parse_session(token, fields)? {
                if session.is_active(now) {
                    active.push(session);
                }
            }
        }
        active.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(active)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut conn = self.conn.clone();
        let mut total = 0u64;
        loop {
            let removed: u64 = self
                .purge_script
                .key(self.expiry_key())
                .arg(to_ms(now))
                .arg(self.session_prefix())
                .arg(self.principal_prefix())
                .arg(PURGE_BATCH)
                .invoke_async(&mut conn)
                .await
                .map_err(store_err)?;
            total += removed;
            if removed < PURGE_BATCH as u64 {
                break;
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn token(value: &str) -> RefreshToken {
        RefreshToken(value.to_string())
    }

    fn stored(principal_id: PrincipalId, revoked: &str) -> HashMap<String, String> {
        HashMap::from([
            ("principal_id".to_string(), principal_id.to_string()),
            ("issued_at".to_string(), "1700000000000".to_string()),
            ("expires_at".to_string(), "1700000600000".to_string()),
            ("revoked".to_string(), revoked.to_string()),
        ])
    }

    fn session(principal_id: PrincipalId) -> RefreshSession {
        let issued_at = truncate_ms(Utc::now()).unwrap();
        RefreshSession {
            token: token("next"),
            principal_id,
            issued_at,
            expires_at: issued_at + ChronoDuration::days(7),
            revoked: false,
        }
    }

    #[test]
    fn parse_session_reads_a_complete_hash() {
        let principal_id = PrincipalId::new_random();
        let parsed = RedisRefreshSessionStore::parse_session(&token("t1"), &stored(principal_id, "0"))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.token, token("t1"));
        assert_eq!(parsed.principal_id, principal_id);
        assert_eq!(parsed.issued_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(parsed.expires_at - parsed.issued_at, ChronoDuration::minutes(10));
        assert!(!parsed.revoked);

        let revoked = RedisRefreshSessionStore::parse_session(&token("t1"), &stored(principal_id, "1"))
            .unwrap()
            .unwrap();
        assert!(revoked.revoked);
    }

    #[test]
    fn parse_session_treats_an_empty_hash_as_missing() {
        let parsed = RedisRefreshSessionStore::parse_session(&token("t1"), &HashMap::new()).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn parse_session_rejects_damaged_records() {
        let principal_id = PrincipalId::new_random();

        let mut missing = stored(principal_id, "0");
        missing.remove("expires_at");
        let mut bad_id = stored(principal_id, "0");
        bad_id.insert("principal_id".to_string(), "not-a-uuid".to_string());
        let mut bad_ms = stored(principal_id, "0");
        bad_ms.insert("issued_at".to_string(), "yesterday".to_string());

        for fields in [missing, bad_id, bad_ms] {
            assert!(matches!(
                RedisRefreshSessionStore::parse_session(&token("t1"), &fields),
                Err(AuthError::Internal(_))
            ));
        }
    }

    #[test]
    fn rotate_outcome_maps_script_status() {
        let principal_id = PrincipalId::new_random();
        let next = session(principal_id);

        assert_eq!(rotate_outcome(1, next.clone()).unwrap(), Some(next.clone()));
        assert_eq!(rotate_outcome(0, next.clone()).unwrap(), None);
        assert_eq!(
            rotate_outcome(-1, next.clone()).unwrap_err(),
            AuthError::Internal("refresh token collision".to_string())
        );
        assert!(matches!(rotate_outcome(7, next), Err(AuthError::Internal(_))));
    }

    /// Runs only when `SCRIPTORIUM_TEST_REDIS_DSN` points at a disposable Redis.
    async fn live_store() -> Option<RedisRefreshSessionStore> {
        let dsn = std::env::var("SCRIPTORIUM_TEST_REDIS_DSN").ok()?;
        let client = redis::Client::open(dsn.as_str()).unwrap();
        let conn = client.get_connection_manager().await.unwrap();
        let prefix = format!("scriptorium-test:{}", nanoid::nanoid!());
        Some(RedisRefreshSessionStore::new(conn, prefix))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn live_concurrent_rotate_succeeds_once() {
        let Some(store) = live_store().await else {
            return;
        };
        let store = Arc::new(store);
        let principal_id = PrincipalId::new_random();
        let now = Utc::now();
        let ttl = Duration::from_secs(3600);
        let first = store.create(principal_id, ttl, now).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let token = first.token.clone();
                tokio::spawn(async move { store.rotate(&token, ttl, now).await })
            })
            .collect();

        let mut rotated = Vec::new();
        for attempt in attempts {
            if let Some(next) = attempt.await.unwrap().unwrap() {
                rotated.push(next);
            }
        }
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0].principal_id, principal_id);

        let active = store.list_active(principal_id, now).await.unwrap();
        assert_eq!(active, rotated);
        assert!(store.find_active(&first.token, now).await.unwrap().is_none());

        store.revoke_all(principal_id).await.unwrap();
        assert_eq!(store.purge_expired(now).await.unwrap(), 2);
    }
}
