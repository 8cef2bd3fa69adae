use crate::application_port::*;
use crate::domain_model::*;
use std::fmt;

#[derive(Clone)]
pub struct PrincipalRecord {
    pub principal: Principal,
    pub password_hash: String,
}

impl fmt::Debug for PrincipalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrincipalRecord")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

/// Read-only view of the principal store owned by the CMS.
#[async_trait::async_trait]
pub trait PrincipalRepo: Send + Sync {
    /// Fetch a principal and its password hash (for login).
    async fn find_by_username(&self, username: &str)
    -> Result<Option<PrincipalRecord>, AuthError>;

    async fn find_by_id(&self, id: PrincipalId) -> Result<Option<Principal>, AuthError>;
}
