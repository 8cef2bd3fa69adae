use crate::application_port::AuthError;
use sqlx::mysql::MySqlDatabaseError;

pub fn store_err<E: std::fmt::Display>(err: E) -> AuthError {
    AuthError::Internal(format!("mysql: {err}"))
}

pub fn is_dup_key(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db) = err {
        if let Some(mysql_err) = db.try_downcast_ref::<MySqlDatabaseError>() {
            return mysql_err.number() == 1062; // ER_DUP_ENTRY
        }
    }

    false
}
