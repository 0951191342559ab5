//! Runtime configuration loaded from the environment (and `.env` when present).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub storage_root: PathBuf,
    pub storage_base_url: String,
    pub render_timeout: Duration,
    pub reservation_grace: Duration,
    pub combine_primary: bool,
    pub bulk_concurrency: usize,
    pub template_cache_ttl: Duration,
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 20,
            storage_root: PathBuf::from("./documents"),
            storage_base_url: "/artifacts".to_string(),
            render_timeout: Duration::from_millis(30_000),
            reservation_grace: Duration::from_secs(3600),
            combine_primary: true,
            bulk_concurrency: 4,
            template_cache_ttl: Duration::from_secs(60),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            database_url: env::var("PDAE_DATABASE_URL").ok(),
            db_max_connections: parse_var("PDAE_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            storage_root: env::var("PDAE_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            storage_base_url: env::var("PDAE_STORAGE_BASE_URL")
                .unwrap_or(defaults.storage_base_url),
            render_timeout: Duration::from_millis(parse_var(
                "PDAE_RENDER_TIMEOUT_MS",
                defaults.render_timeout.as_millis() as u64,
            )?),
            reservation_grace: Duration::from_secs(parse_var(
                "PDAE_RESERVATION_GRACE_SECS",
                defaults.reservation_grace.as_secs(),
            )?),
            combine_primary: parse_var("PDAE_COMBINE_PRIMARY", defaults.combine_primary)?,
            bulk_concurrency: parse_var("PDAE_BULK_CONCURRENCY", defaults.bulk_concurrency)?
                .max(1),
            template_cache_ttl: Duration::from_secs(parse_var(
                "PDAE_TEMPLATE_CACHE_SECS",
                defaults.template_cache_ttl.as_secs(),
            )?),
            bind_addr: env::var("PDAE_BIND_ADDR").unwrap_or(defaults.bind_addr),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("PDAE_DATABASE_URL"))
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}
