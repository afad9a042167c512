//! Cache-related error types

use thiserror::Error;

/// Cache operation errors
///
/// Only [`CacheError::Configuration`] and [`CacheError::Serialization`] ever
/// escape the [`Cache`](crate::Cache) facade. Everything else is reported as a
/// miss on reads and as `false` on writes.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A required dependency or backend field is missing or invalid
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The backing store is unreachable or rejected the operation
    #[error("Store error: {message}")]
    Store { message: String },

    /// A dependency could not be evaluated for a transient reason
    #[error("Dependency evaluation failed: {message}")]
    Dependency { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Lock acquisition failed")]
    LockError,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::Dependency {
            message: message.into(),
        }
    }

    /// Whether this error is a programmer mistake that must reach the caller
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

/// Re-export commonly used Result type
pub type Result<T> = std::result::Result<T, CacheError>;
