use crate::application_impl::*;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::infra_memory::*;
use crate::infra_mysql::*;
use crate::infra_redis::*;
use crate::logger::*;
use crate::server::ExpirySweeper;
use crate::settings::{SeedPrincipal, Settings};
use anyhow::{Context, anyhow};
use nanoid::nanoid;
use sqlx::MySqlPool;
use sqlx::mysql::MySqlPoolOptions;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[cfg(debug_assertions)]
const DEV_SIGNING_KEY: &str = "scriptorium-dev-signing-key";

pub struct Server {
    pub session_service: Arc<dyn SessionService>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    pool: Option<MySqlPool>,
}

impl Server {
    pub async fn try_new(settings: &Settings) -> anyhow::Result<Self> {
        let alphabet: [char; 16] = [
            '1', '2', '3', '4', '5', '6', '7', '8', '9', '0', 'a', 'b', 'c', 'd', 'e', 'f',
        ];
        let run_id = nanoid!(10, &alphabet);
        info!(%run_id, "server starting");

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let credential_hasher: Arc<dyn CredentialHasher> = Arc::new(Argon2PasswordHasher);

        let pool = match &settings.database {
            Some(db) => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(db.max_connections)
                    .connect(&db.dsn)
                    .await
                    .context("connecting to mysql")?;
                if db.run_migrations {
                    sqlx::migrate!("./migrations")
                        .run(&pool)
                        .await
                        .context("running migrations")?;
                    info!("migrations applied");
                }
                Some(pool)
            }
            None => None,
        };
        let require_pool = || {
            pool.clone()
                .ok_or_else(|| anyhow!("[database] settings are missing"))
        };

        let session_store: Arc<dyn RefreshSessionStore> = match settings.store.backend.as_str() {
            "mysql" => Arc::new(MySqlRefreshSessionStore::new(require_pool()?)),
            "redis" => {
                let redis = settings
                    .redis
                    .as_ref()
                    .ok_or_else(|| anyhow!("[redis] settings are missing"))?;
                let redis_client = redis::Client::open(redis.dsn.as_str())?;
                let redis_manager = redis_client.get_connection_manager().await?;
                Arc::new(RedisRefreshSessionStore::new(
                    redis_manager,
                    redis.prefix.clone(),
                ))
            }
            "memory" => Arc::new(InMemoryRefreshSessionStore::new()),
            other => return Err(anyhow!("Unknown store backend: {}", other)),
        };

        let principal_repo: Arc<dyn PrincipalRepo> = match settings.principal.backend.as_str() {
            "mysql" => Arc::new(MySqlPrincipalRepo::new(require_pool()?)),
            "memory" => {
                let repo = InMemoryPrincipalRepo::new();
                seed_principals(&repo, &settings.principal.seed, credential_hasher.as_ref())
                    .await?;
                Arc::new(repo)
            }
            other => return Err(anyhow!("Unknown principal backend: {}", other)),
        };

        let session_service: Arc<dyn SessionService> = match settings.auth.backend.as_str() {
            "real" => {
                let codec: Arc<dyn CredentialCodec> = Arc::new(JwtHs256Codec::new(
                    JwtConfig {
                        issuer: settings.auth.issuer.clone(),
                        audience: settings.auth.audience.clone(),
                        signing_key: load_signing_key(&settings.auth.signing_key_env)?,
                    },
                    clock.clone(),
                ));
                Arc::new(RealSessionService::new(
                    principal_repo,
                    credential_hasher,
                    codec,
                    session_store.clone(),
                    clock.clone(),
                    SessionTtl {
                        access: settings.auth.access_ttl(),
                        refresh: settings.auth.refresh_ttl(),
                    },
                ))
            }
            other => return Err(anyhow!("Unknown auth backend: {}", other)),
        };

        // region runtime infra
        let cancel = CancellationToken::new();

        let sweeper = ExpirySweeper::new(
            session_store,
            clock,
            settings.sweeper.interval(),
            cancel.clone(),
        );
        let sweeper_handle = tokio::spawn(async move {
            if let Err(e) = sweeper.run().await {
                error!("sweeper stopped: {:#}", e);
            }
        });

        // endregion

        info!("server started");

        Ok(Self {
            session_service,
            sweeper_handle: Mutex::new(Some(sweeper_handle)),
            cancel,
            pool,
        })
    }

    pub async fn shutdown(&self) {
        info!("server shutting down...");

        self.cancel.cancel();

        let handle = match self.sweeper_handle.lock() {
            Ok(mut lock) => lock.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let r = handle.await;
            info!("sweeper handle dropped: {:?}", r);
        }

        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

fn load_signing_key(var: &str) -> anyhow::Result<Vec<u8>> {
    match std::env::var(var) {
        Ok(key) if !key.is_empty() => Ok(key.into_bytes()),
        #[cfg(debug_assertions)]
        _ => {
            warn!(env = var, "signing key not set, using the dev key");
            Ok(DEV_SIGNING_KEY.as_bytes().to_vec())
        }
        #[cfg(not(debug_assertions))]
        _ => Err(anyhow!("signing key env var {} is not set", var)),
    }
}

async fn seed_principals(
    repo: &InMemoryPrincipalRepo,
    seeds: &[SeedPrincipal],
    hasher: &dyn CredentialHasher,
) -> anyhow::Result<()> {
    for seed in seeds {
        let role: Role = seed.role.parse()?;
        let password_hash = hasher.hash_password(&seed.password).await?;
        repo.insert(PrincipalRecord {
            principal: Principal {
                id: PrincipalId::new_random(),
                username: seed.username.clone(),
                role,
                is_active: seed.is_active,
            },
            password_hash,
        });
    }
    debug!(count = seeds.len(), "seeded in-memory principals");
    Ok(())
}
