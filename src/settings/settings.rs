use anyhow::{Result, anyhow, bail};
use config::{Config, File};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub auth: Auth,
    pub store: Store,
    pub principal: PrincipalSource,
    pub database: Option<Database>,
    pub redis: Option<Redis>,
    pub sweeper: Sweeper,
    pub http: Http,
    pub log: Log,
    pub client: Client,
}

#[derive(Debug, Deserialize)]
pub struct Auth {
    pub backend: String, // "real"
    pub issuer: String,
    pub audience: String,
    /// Name of the environment variable holding the HS256 secret.
    pub signing_key_env: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

impl Auth {
    pub fn access_ttl(&self) -> Duration {
        Duration::from_secs(self.access_ttl_secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct Store {
    pub backend: String, // "mysql", "redis" or "memory"
}

#[derive(Debug, Deserialize)]
pub struct PrincipalSource {
    pub backend: String, // "mysql" or "memory"
    #[serde(default)]
    pub seed: Vec<SeedPrincipal>,
}

#[derive(Clone, Deserialize)]
pub struct SeedPrincipal {
    pub username: String,
    pub password: String,
    pub role: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl fmt::Debug for SeedPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedPrincipal")
            .field("username", &self.username)
            .field("role", &self.role)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct Database {
    pub dsn: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub run_migrations: bool,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("max_connections", &self.max_connections)
            .field("run_migrations", &self.run_migrations)
            .finish_non_exhaustive()
    }
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Deserialize)]
pub struct Redis {
    pub dsn: String,
    pub prefix: String,
}

impl fmt::Debug for Redis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redis")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct Sweeper {
    pub interval_secs: u64,
}

impl Sweeper {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct Http {
    pub address: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Log {
    pub filter: String,
}

/// Used by API consumers built on `client::AuthorizedClient`.
#[derive(Debug, Deserialize)]
pub struct Client {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Client {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Upper bound for either token TTL: one year.
pub const MAX_TTL_SECS: u64 = 365 * 24 * 3600;

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.auth.access_ttl_secs == 0 || self.auth.refresh_ttl_secs == 0 {
            bail!("auth TTLs must be positive");
        }
        if self.auth.refresh_ttl_secs > MAX_TTL_SECS {
            bail!("auth TTLs must not exceed {} seconds", MAX_TTL_SECS);
        }
        if self.auth.access_ttl_secs >= self.auth.refresh_ttl_secs {
            bail!("access TTL must be shorter than refresh TTL");
        }
        if self.sweeper.interval_secs == 0 {
            bail!("sweeper interval must be positive");
        }
        if self.client.request_timeout_secs == 0 {
            bail!("client request timeout must be positive");
        }
        let needs_database =
            self.store.backend == "mysql" || self.principal.backend == "mysql";
        if needs_database && self.database.is_none() {
            bail!("[database] is required by the mysql backend");
        }
        if self.store.backend == "redis" && self.redis.is_none() {
            bail!("[redis] is required by the redis store backend");
        }
        if self.http.cert_path.is_some() != self.http.key_path.is_some() {
            bail!("http.cert_path and http.key_path must be set together");
        }
        Ok(())
    }
}

#[cfg(debug_assertions)]
const SETTINGS_PATH: &str = "settings/dev.toml";
#[cfg(not(debug_assertions))]
const SETTINGS_PATH: &str = "settings/release.toml";

pub fn parse_settings(path: Option<&str>) -> Result<Settings> {
    let path = path.unwrap_or(SETTINGS_PATH);

    let settings: Settings = Config::builder()
        .add_source(File::with_name(path))
        .build()
        .map_err(|e| anyhow!(e))?
        .try_deserialize()
        .map_err(|e| anyhow!(e))?;

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_path(rel: &str) -> String {
        format!("{}/{}", env!("CARGO_MANIFEST_DIR"), rel)
    }

    #[test]
    fn dev_settings_parse_and_validate() {
        let settings = parse_settings(Some(manifest_path("settings/dev.toml").as_str())).unwrap();
        assert_eq!(settings.store.backend, "memory");
        assert!(settings.auth.access_ttl() < settings.auth.refresh_ttl());
        assert!(!settings.principal.seed.is_empty());
    }

    #[test]
    fn release_settings_parse_and_validate() {
        let settings = parse_settings(Some(manifest_path("settings/release.toml").as_str())).unwrap();
        assert_eq!(settings.store.backend, "mysql");
        assert!(settings.database.is_some());
        assert!(settings.http.cert_path.is_some());
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        let mut settings = parse_settings(Some(manifest_path("settings/dev.toml").as_str())).unwrap();
        settings.auth.refresh_ttl_secs = MAX_TTL_SECS;
        assert!(settings.validate().is_ok());

        settings.auth.refresh_ttl_secs = MAX_TTL_SECS + 1;
        assert!(settings.validate().is_err());

        settings.auth.refresh_ttl_secs = u64::MAX;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(parse_settings(Some("")).is_err());
    }

    #[test]
    fn seed_password_is_not_printed() {
        let seed = SeedPrincipal {
            username: "admin".into(),
            password: "s3cret-pass".into(),
            role: "admin".into(),
            is_active: true,
        };
        assert!(!format!("{seed:?}").contains("s3cret-pass"));
    }
}
