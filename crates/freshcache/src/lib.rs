//! # freshcache
//!
//! Store-agnostic caching facade with dependency-driven invalidation.
//!
//! ## Features
//!
//! - **Pluggable stores**: any backend implementing six raw byte operations
//! - **Dependencies**: entries carry a snapshot of external state and are
//!   discarded on read once that state changes
//! - **Namespaced keys**: caller keys are hashed under a per-application prefix
//! - **Probabilistic GC**: opportunistic sweeps for stores without native expiry
//! - **Performance monitoring**: hit, miss and invalidation statistics
//!
//! ```
//! use std::sync::Arc;
//! use freshcache::{CacheBuilder, MemoryStore};
//!
//! let cache = CacheBuilder::new()
//!     .store(Arc::new(MemoryStore::new()))
//!     .key_prefix("docs")
//!     .build()
//!     .unwrap();
//!
//! cache.set("answer", &42, None, None).unwrap();
//! assert_eq!(cache.get::<i32>("answer").unwrap(), Some(42));
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod dependency;
pub mod envelope;
pub mod error;
pub mod gc;
pub mod keyspace;
pub mod metrics;
pub mod store;

pub use cache::{Cache, CacheBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ConfigFormat};
pub use dependency::{
    Dependency, DependencyContext, DependencySpec, DependentData, GlobalState, QueryRunner,
    SharedGlobalState,
};
pub use envelope::{Envelope, EnvelopeCodec};
pub use error::{CacheError, Result};
pub use gc::GcPolicy;
pub use keyspace::{KeySpace, PhysicalKey};
pub use metrics::{CacheMetrics, CacheStats};
pub use store::{CacheStore, GarbageCollect, MemoryStore, NullStore};
