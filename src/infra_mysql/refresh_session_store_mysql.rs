use super::util::{is_dup_key, store_err};
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlConnection, MySqlPool, Row};
use std::sync::Arc;
use std::time::Duration;

const SESSION_COLUMNS: &str = "token, principal_id, issued_at, expires_at, revoked";

pub struct MySqlRefreshSessionStore {
    pool: MySqlPool,
    generator: Arc<dyn RefreshTokenGenerator>,
}

impl MySqlRefreshSessionStore {
    pub fn new(pool: MySqlPool) -> Self {
        MySqlRefreshSessionStore {
            pool,
            generator: Arc::new(OsRngTokenGenerator),
        }
    }

    fn row_to_session(row: &MySqlRow) -> Result<RefreshSession, AuthError> {
        let token: String = row.try_get("token").map_err(store_err)?;
        let principal_id: PrincipalId = row.try_get("principal_id").map_err(store_err)?;
        let issued_at: DateTime<Utc> = row.try_get("issued_at").map_err(store_err)?;
        let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(store_err)?;
        let revoked: bool = row.try_get("revoked").map_err(store_err)?;

        Ok(RefreshSession {
            token: RefreshToken(token),
            principal_id,
            issued_at,
            expires_at,
            revoked,
        })
    }

    async fn insert(
        &self,
        conn: &mut MySqlConnection,
        principal_id: PrincipalId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RefreshSession, AuthError> {
        let session = RefreshSession {
            token: self.generator.generate(),
            principal_id,
            issued_at: now,
            expires_at: expiry_after(now, ttl)?,
            revoked: false,
        };

        let res = sqlx::query(
            r#"
INSERT INTO refresh_session (token, principal_id, issued_at, expires_at, revoked)
VALUES (?, ?, ?, ?, FALSE)
"#,
        )
        .bind(session.token.as_str())
        .bind(session.principal_id)
        .bind(session.issued_at)
        .bind(session.expires_at)
        .execute(conn)
        .await;

        match res {
            Ok(_) => Ok(session),
            Err(e) if is_dup_key(&e) => Err(token_collision(principal_id)),
            Err(e) => Err(store_err(e)),
        }
    }
}

#[async_trait::async_trait]
impl RefreshSessionStore for MySqlRefreshSessionStore {
    async fn create(
        &self,
        principal_id: PrincipalId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<RefreshSession, AuthError> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        self.insert(&mut *conn, principal_id, ttl, now).await
    }

    async fn find_active(
        &self,
        token: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError> {
        let row_opt = sqlx::query(&format!(
            r#"
SELECT {SESSION_COLUMNS}
FROM refresh_session
WHERE token = ? AND revoked = FALSE AND expires_at > ?
"#
        ))
        .bind(token.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row_opt.as_ref().map(Self::row_to_session).transpose()
    }

    async fn lookup(&self, token: &RefreshToken) -> Result<Option<RefreshSession>, AuthError> {
        let row_opt = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM refresh_session WHERE token = ?"
        ))
        .bind(token.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row_opt.as_ref().map(Self::row_to_session).transpose()
    }

    async fn rotate(
        &self,
        token: &RefreshToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RefreshSession>, AuthError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        // The conditional update is the compare-and-set: of two concurrent
        // callers presenting the same token, only one sees a changed row.
        let consumed = sqlx::query(
            r#"
UPDATE refresh_session
SET revoked = TRUE
WHERE token = ? AND revoked = FALSE AND expires_at > ?
"#,
        )
        .bind(token.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected();

        if consumed != 1 {
            tx.rollback().await.map_err(store_err)?;
            return Ok(None);
        }

        let principal_id: PrincipalId =
            sqlx::query_scalar("SELECT principal_id FROM refresh_session WHERE token = ?")
                .bind(token.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?;

        let next = self.insert(&mut *tx, principal_id, ttl, now).await?;
        tx.commit().await.map_err(store_err)?;

        Ok(Some(next))
    }

    async fn revoke(&self, token: &RefreshToken) -> Result<(), AuthError> {
        sqlx::query("UPDATE refresh_session SET revoked = TRUE WHERE token = ?")
            .bind(token.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(())
    }

    async fn revoke_all(&self, principal_id: PrincipalId) -> Result<u64, AuthError> {
        let result = sqlx::query(
            r#"
UPDATE refresh_session
SET revoked = TRUE
WHERE principal_id = ? AND revoked = FALSE
"#,
        )
        .bind(principal_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(result.rows_affected())
    }

    async fn list_active(
        &self,
        principal_id: PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RefreshSession>, AuthError> {
        let rows = sqlx::query(&format!(
            r#"
SELECT {SESSION_COLUMNS}
FROM refresh_session
WHERE principal_id = ? AND revoked = FALSE AND expires_at > ?
ORDER BY issued_at DESC
"#
        ))
        .bind(principal_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.iter().map(Self::row_to_session).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let result =
            sqlx::query("DELETE FROM refresh_session WHERE revoked = TRUE OR expires_at < ?")
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    /// Runs only when `SCRIPTORIUM_TEST_MYSQL_DSN` points at a disposable database.
    async fn live_pool() -> Option<MySqlPool> {
        let dsn = std::env::var("SCRIPTORIUM_TEST_MYSQL_DSN").ok()?;
        let pool = MySqlPool::connect(&dsn).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Some(pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn live_concurrent_rotate_succeeds_once() {
        let Some(pool) = live_pool().await else {
            return;
        };
        let store = Arc::new(MySqlRefreshSessionStore::new(pool.clone()));
        let principal_id = PrincipalId::new_random();
        // DATETIME(6) keeps microseconds.
        let now = Utc::now().trunc_subsecs(6);
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
            if let Ok(Some(next)) = attempt.await.unwrap() {
                rotated.push(next);
            }
        }
        assert_eq!(rotated.len(), 1);

        let active = store.list_active(principal_id, now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].token, rotated[0].token);
        assert!(store.find_active(&first.token, now).await.unwrap().is_none());
        assert!(store.lookup(&first.token).await.unwrap().unwrap().revoked);

        sqlx::query("DELETE FROM refresh_session WHERE principal_id = ?")
            .bind(principal_id)
            .execute(&pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn live_rotate_of_an_expired_token_changes_nothing() {
        let Some(pool) = live_pool().await else {
            return;
        };
        let store = MySqlRefreshSessionStore::new(pool.clone());
        let principal_id = PrincipalId::new_random();
        let now = Utc::now().trunc_subsecs(6);
        let ttl = Duration::from_secs(60);
        let first = store.create(principal_id, ttl, now).await.unwrap();

        let later = now + chrono::Duration::seconds(61);
        assert!(store.rotate(&first.token, ttl, later).await.unwrap().is_none());
        assert!(!store.lookup(&first.token).await.unwrap().unwrap().revoked);
        assert_eq!(store.list_active(principal_id, now).await.unwrap().len(), 1);

        sqlx::query("DELETE FROM refresh_session WHERE principal_id = ?")
            .bind(principal_id)
            .execute(&pool)
            .await
            .unwrap();
    }
}
