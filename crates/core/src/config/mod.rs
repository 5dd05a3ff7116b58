//! Cache configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (WEBCACHE_*)
//! 2. TOML config file (if WEBCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::expiry::MAX_TTL;
use crate::key::DEFAULT_NAMESPACE;
use crate::persistence::{MemoryFactory, PersistenceFactory, SqliteFactory};
use crate::record::Codec;
use crate::storage::CacheStorage;

mod validation;

pub use validation::ConfigError;

/// Which persistence backend caches are stored in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Volatile in-process store.
    #[default]
    Memory,
    /// Embedded SQLite database at `db_path`.
    Sqlite,
    /// Redis server at `redis_url` (provided by the `webcache-redis` crate).
    Redis,
}

/// Cache configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (WEBCACHE_*)
/// 2. TOML config file (if WEBCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// First part of every persistence key. Must not contain `:`.
    ///
    /// Set via WEBCACHE_NAMESPACE environment variable.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Set via WEBCACHE_BACKEND environment variable (`memory`, `sqlite`, `redis`).
    #[serde(default)]
    pub backend: Backend,

    /// Stored record encoding (`json` or `binary`).
    ///
    /// Set via WEBCACHE_CODEC environment variable.
    #[serde(default)]
    pub codec: Codec,

    /// Ceiling for any computed time-to-live, in seconds.
    ///
    /// Set via WEBCACHE_MAX_TTL_SECS environment variable.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// Path to the SQLite database.
    ///
    /// Set via WEBCACHE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Set via WEBCACHE_REDIS_URL environment variable.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Connections opened eagerly by a remote backend.
    #[serde(default = "default_pool_min")]
    pub pool_min: usize,

    /// Upper bound on pooled connections.
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,

    /// How long to wait for a pooled connection, in milliseconds.
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,

    /// Records fetched per round trip by windowed remote reads.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Run `put`/`delete` of each cache through its operation queue.
    #[serde(default = "default_true")]
    pub serialize_ops: bool,

    /// Merge backend-reported cache names into `CacheStorage::keys`.
    #[serde(default)]
    pub discover_remote_names: bool,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

fn default_max_ttl_secs() -> u64 {
    MAX_TTL.as_secs()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./webcache.sqlite")
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_pool_min() -> usize {
    1
}

fn default_pool_max() -> usize {
    8
}

fn default_pool_timeout_ms() -> u64 {
    5_000
}

fn default_page_size() -> usize {
    50
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            backend: Backend::default(),
            codec: Codec::default(),
            max_ttl_secs: default_max_ttl_secs(),
            db_path: default_db_path(),
            redis_url: default_redis_url(),
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
            pool_timeout_ms: default_pool_timeout_ms(),
            page_size: default_page_size(),
            serialize_ops: true,
            discover_remote_names: false,
        }
    }
}

impl CacheConfig {
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    /// Pool acquisition timeout as Duration.
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `WEBCACHE_`
    /// 2. TOML file from `WEBCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("WEBCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("WEBCACHE_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Persistence factory for the in-crate backends.
    ///
    /// # Errors
    ///
    /// Returns `Error::Backend` for [`Backend::Redis`], which is built by the
    /// `webcache-redis` crate, and any error opening the SQLite database.
    pub async fn factory(&self) -> Result<Arc<dyn PersistenceFactory>, Error> {
        match self.backend {
            Backend::Memory => Ok(Arc::new(MemoryFactory::new(&self.namespace, self.max_ttl()))),
            Backend::Sqlite => {
                let factory = SqliteFactory::open(&self.db_path, &self.namespace, self.max_ttl(), self.codec).await?;
                Ok(Arc::new(factory))
            }
            Backend::Redis => Err(Error::backend("the redis backend is provided by webcache-redis")),
        }
    }

    /// A [`CacheStorage`] over `factory` using this configuration's cache settings.
    pub fn storage(&self, factory: Arc<dyn PersistenceFactory>) -> CacheStorage {
        CacheStorage::new(factory)
            .with_serialized_ops(self.serialize_ops)
            .with_discovery(self.discover_remote_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.namespace, "webcache");
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.codec, Codec::Binary);
        assert_eq!(config.max_ttl(), MAX_TTL);
        assert_eq!(config.db_path, PathBuf::from("./webcache.sqlite"));
        assert_eq!(config.pool_min, 1);
        assert_eq!(config.pool_max, 8);
        assert_eq!(config.page_size, 50);
        assert!(config.serialize_ops);
        assert!(!config.discover_remote_names);
    }

    #[test]
    fn test_pool_timeout_duration() {
        let config = CacheConfig::default();
        assert_eq!(config.pool_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_load_from_env_and_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("webcache.toml", "namespace = \"filens\"\nbackend = \"sqlite\"\npage_size = 10")?;
            jail.set_env("WEBCACHE_CONFIG_FILE", "webcache.toml");
            jail.set_env("WEBCACHE_PAGE_SIZE", "25");
            jail.set_env("WEBCACHE_CODEC", "json");

            let config = CacheConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.namespace, "filens");
            assert_eq!(config.backend, Backend::Sqlite);
            assert_eq!(config.page_size, 25);
            assert_eq!(config.codec, Codec::Json);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("WEBCACHE_NAMESPACE", "a:b");
            assert!(matches!(CacheConfig::load(), Err(ConfigError::Invalid { .. })));
            Ok(())
        });
    }

    #[tokio::test]
    async fn test_factory_for_backends() {
        let memory = CacheConfig::default();
        assert!(memory.factory().await.is_ok());

        let redis = CacheConfig { backend: Backend::Redis, ..Default::default() };
        assert!(matches!(redis.factory().await, Err(Error::Backend(_))));
    }

    #[tokio::test]
    async fn test_storage_applies_settings() {
        let config = CacheConfig { serialize_ops: false, ..Default::default() };
        let storage = config.storage(config.factory().await.unwrap());
        let cache = storage.open("v1").await.unwrap();
        assert!(format!("{cache:?}").contains("serialized: false"));
    }
}
