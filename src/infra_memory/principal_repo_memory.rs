use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use std::collections::HashMap;
use std::sync::RwLock;

/// Principal store held in memory, seeded from settings in dev setups.
#[derive(Default)]
pub struct InMemoryPrincipalRepo {
    by_username: RwLock<HashMap<String, PrincipalRecord>>,
}

impl InMemoryPrincipalRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: PrincipalRecord) {
        if let Ok(mut map) = self.by_username.write() {
            map.insert(record.principal.username.clone(), record);
        }
    }

    pub fn set_active(&self, id: PrincipalId, is_active: bool) {
        if let Ok(mut map) = self.by_username.write() {
            for record in map.values_mut().filter(|r| r.principal.id == id) {
                record.principal.is_active = is_active;
            }
        }
    }
}

#[async_trait::async_trait]
impl PrincipalRepo for InMemoryPrincipalRepo {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<PrincipalRecord>, AuthError> {
        let map = self
            .by_username
            .read()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        Ok(map.get(username).cloned())
    }

    async fn find_by_id(&self, id: PrincipalId) -> Result<Option<Principal>, AuthError> {
        let map = self
            .by_username
            .read()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        Ok(map
            .values()
            .find(|r| r.principal.id == id)
            .map(|r| r.principal.clone()))
    }
}
