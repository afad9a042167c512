//! Store selection from configuration files
//!
//! ```yaml
//! cache:
//!   key_prefix: shop
//!   default_ttl: 300
//! store:
//!   backend: file
//!   path: /var/cache/shop
//!   directory_levels: 1
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use freshcache::{
    config::{load_from_file, load_from_str, ConfigFormat},
    gc::{GcPolicy, DEFAULT_GC_PROBABILITY},
    Cache, CacheConfig, CacheStore, DependencyContext, MemoryStore, NullStore, Result,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{BackendError, BackendResult},
    file::{FileStore, DEFAULT_SUFFIX},
};

fn default_gc_probability() -> u32 {
    DEFAULT_GC_PROBABILITY
}

fn default_suffix() -> String {
    DEFAULT_SUFFIX.to_string()
}

fn default_table() -> String {
    "cache".to_string()
}

fn default_true() -> bool {
    true
}

/// One Redis server in the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisServer {
    pub host: String,
    pub port: u16,
    /// Relative share of keys routed to this server; 0 takes none
    pub weight: u32,
    /// Connect, read and write timeout in milliseconds
    pub timeout_ms: u64,
    pub database: i64,
    pub password: Option<String>,
}

impl Default for RedisServer {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            weight: 1,
            timeout_ms: 1000,
            database: 0,
            password: None,
        }
    }
}

impl RedisServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Backend selection, tagged by `backend`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    Null,
    File {
        path: PathBuf,
        #[serde(default = "default_suffix")]
        suffix: String,
        #[serde(default)]
        directory_levels: usize,
        #[serde(default = "default_gc_probability")]
        gc_probability_per_million: u32,
    },
    Sqlite {
        /// Database file; in-memory when absent
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default = "default_table")]
        table: String,
        #[serde(default = "default_true")]
        auto_create_table: bool,
        #[serde(default = "default_gc_probability")]
        gc_probability_per_million: u32,
    },
    Redis {
        servers: Vec<RedisServer>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl StoreConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Null => "null",
            Self::File { .. } => "file",
            Self::Sqlite { .. } => "sqlite",
            Self::Redis { .. } => "redis",
        }
    }

    /// Construct the configured store
    pub fn build(&self) -> BackendResult<Arc<dyn CacheStore>> {
        let store: Arc<dyn CacheStore> = match self {
            Self::Memory => Arc::new(MemoryStore::new()),
            Self::Null => Arc::new(NullStore),
            Self::File {
                path,
                suffix,
                directory_levels,
                gc_probability_per_million,
            } => Arc::new(
                FileStore::new(path)?
                    .with_suffix(suffix.clone())
                    .with_directory_levels(*directory_levels)
                    .with_gc_policy(GcPolicy::new(*gc_probability_per_million)),
            ),
            Self::Sqlite {
                path,
                table,
                auto_create_table,
                gc_probability_per_million,
            } => build_sqlite(
                path.as_deref(),
                table,
                *auto_create_table,
                *gc_probability_per_million,
            )?,
            Self::Redis { servers } => build_redis(servers)?,
        };

        info!("Initialized {} cache store", self.backend_name());
        Ok(store)
    }
}

#[cfg(feature = "sqlite")]
fn build_sqlite(
    path: Option<&Path>,
    table: &str,
    auto_create_table: bool,
    gc_probability_per_million: u32,
) -> BackendResult<Arc<dyn CacheStore>> {
    use crate::sqlite::SqliteStore;

    let conn = match path {
        Some(path) => rusqlite::Connection::open(path)?,
        None => rusqlite::Connection::open_in_memory()?,
    };
    Ok(Arc::new(
        SqliteStore::from_connection(conn, table, auto_create_table)?
            .with_gc_policy(GcPolicy::new(gc_probability_per_million)),
    ))
}

#[cfg(not(feature = "sqlite"))]
fn build_sqlite(
    _path: Option<&Path>,
    _table: &str,
    _auto_create_table: bool,
    _gc_probability_per_million: u32,
) -> BackendResult<Arc<dyn CacheStore>> {
    Err(BackendError::Unavailable("sqlite"))
}

#[cfg(feature = "redis")]
fn build_redis(servers: &[RedisServer]) -> BackendResult<Arc<dyn CacheStore>> {
    Ok(Arc::new(crate::redis_store::RedisStore::new(servers.to_vec())?))
}

#[cfg(not(feature = "redis"))]
fn build_redis(_servers: &[RedisServer]) -> BackendResult<Arc<dyn CacheStore>> {
    Err(BackendError::Unavailable("redis"))
}

/// Construct a store, reporting failures as configuration errors
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn CacheStore>> {
    config.build().map_err(|e| match e {
        BackendError::InvalidConfig(_) | BackendError::Unavailable(_) => e.into(),
        other => freshcache::CacheError::configuration(format!(
            "failed to initialize {} store: {}",
            config.backend_name(),
            other
        )),
    })
}

/// Complete cache settings: facade options plus the backing store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cache: CacheConfig,
    pub store: StoreConfig,
}

impl Settings {
    /// Load settings from a YAML, TOML or JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_from_file(path)
    }

    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        load_from_str(content, format)
    }

    pub fn build_cache(&self) -> Result<Cache> {
        self.build_cache_with(DependencyContext::new())
    }

    /// Build a cache whose dependencies evaluate against `context`
    pub fn build_cache_with(&self, context: DependencyContext) -> Result<Cache> {
        let store = build_store(&self.store)?;
        Ok(Cache::with_config(store, self.cache.clone()).with_context(context))
    }
}
