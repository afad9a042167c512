//! Backend failures and their mapping onto the core error taxonomy

use freshcache::CacheError;
use thiserror::Error;

/// Errors raised by the reference backends
#[derive(Error, Debug)]
pub enum BackendError {
    /// A store was configured with missing or invalid options
    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lock acquisition failed")]
    LockPoisoned,

    #[error("Backend {0} was not compiled into this build")]
    Unavailable(&'static str),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidConfig(message) => CacheError::configuration(message),
            BackendError::Unavailable(backend) => {
                CacheError::configuration(format!("backend {} is not available", backend))
            }
            BackendError::Io(e) => CacheError::Io(e),
            BackendError::LockPoisoned => CacheError::LockError,
            #[allow(unreachable_patterns)]
            other => CacheError::store(other.to_string()),
        }
    }
}
