//! # freshcache backends
//!
//! Reference [`CacheStore`](freshcache::CacheStore) implementations for
//! external media, and construction of a cache from configuration files.
//!
//! ## Features
//!
//! - **File store**: one file per entry with an expiry header, optional
//!   directory sharding and probabilistic garbage collection
//! - **SQLite store** (`sqlite` feature): a single cache table plus a
//!   [`SqliteQueryRunner`] for `DatabaseQuery` dependencies
//! - **Redis store** (`redis` feature): weighted multi-server pool with
//!   native expiry
//! - **Settings**: YAML, TOML or JSON files selecting and tuning a backend

pub mod config;
pub mod error;
pub mod file;
#[cfg(feature = "redis")]
pub mod redis_store;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use config::{build_store, RedisServer, Settings, StoreConfig};
pub use error::{BackendError, BackendResult};
pub use file::FileStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteQueryRunner, SqliteStore};
