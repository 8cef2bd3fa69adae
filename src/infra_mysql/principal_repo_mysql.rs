use super::util::store_err;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};

/// Reads the CMS-owned `principal` table. This core never writes to it.
pub struct MySqlPrincipalRepo {
    pool: MySqlPool,
}

impl MySqlPrincipalRepo {
    pub fn new(pool: MySqlPool) -> Self {
        MySqlPrincipalRepo { pool }
    }

    fn row_to_principal(row: &MySqlRow) -> Result<Principal, AuthError> {
        let id: PrincipalId = row.try_get("principal_id").map_err(store_err)?;
        let username: String = row.try_get("username").map_err(store_err)?;
        let role: String = row.try_get("role").map_err(store_err)?;
        let role = role.parse::<Role>().map_err(store_err)?;
        let is_active: bool = row.try_get("is_active").map_err(store_err)?;

        Ok(Principal {
            id,
            username,
            role,
            is_active,
        })
    }

    fn row_to_record(row: MySqlRow) -> Result<PrincipalRecord, AuthError> {
        let principal = Self::row_to_principal(&row)?;
        let password_hash: String = row.try_get("password_hash").map_err(store_err)?;

        Ok(PrincipalRecord {
            principal,
            password_hash,
        })
    }
}

#[async_trait::async_trait]
impl PrincipalRepo for MySqlPrincipalRepo {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PrincipalRecord>, AuthError> {
        let row_opt: Option<MySqlRow> = sqlx::query(
            r#"
SELECT principal_id, username, password_hash, role, is_active
FROM principal
WHERE username = ?
"#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row_opt.map(Self::row_to_record).transpose()
    }

    async fn find_by_id(&self, id: PrincipalId) -> Result<Option<Principal>, AuthError> {
        let row_opt: Option<MySqlRow> = sqlx::query(
            r#"
SELECT principal_id, username, role, is_active
FROM principal
WHERE principal_id = ?
"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        row_opt.as_ref().map(Self::row_to_principal).transpose()
    }
}
