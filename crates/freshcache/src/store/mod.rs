//! Backend contract and the in-process stores
//!
//! A [`CacheStore`] moves opaque bytes under [`PhysicalKey`]s and knows
//! nothing about envelopes or dependencies. `ttl_secs == 0` means the entry
//! never expires. Backends without native expiration keep the absolute
//! expiry next to the payload, treat a past-expiry read as a miss and delete
//! the entry on the way; they also implement [`GarbageCollect`].

use std::collections::HashMap;

use crate::{keyspace::PhysicalKey, Result};

pub mod memory;
pub mod null;

pub use memory::MemoryStore;
pub use null::NullStore;

/// Raw backend operations
pub trait CacheStore: Send + Sync {
    /// Retrieve a payload, `None` when absent or expired
    fn get_raw(&self, key: &PhysicalKey) -> Result<Option<Vec<u8>>>;

    /// Retrieve several payloads; absent keys are left out of the map
    fn get_many_raw(&self, keys: &[PhysicalKey]) -> Result<HashMap<PhysicalKey, Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(payload) = self.get_raw(key)? {
                found.insert(key.clone(), payload);
            }
        }
        Ok(found)
    }

    /// Store a payload, replacing any previous one
    fn set_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool>;

    /// Store a payload only if the key is absent or expired.
    ///
    /// Must be atomic with respect to every process sharing the backend.
    fn add_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool>;

    /// Remove a payload; removing an absent key is not an error
    fn delete_raw(&self, key: &PhysicalKey) -> Result<bool>;

    /// Remove every payload owned by this store
    fn flush_raw(&self) -> Result<bool>;
}

/// Sweep hook for backends that lack native expiration
pub trait GarbageCollect {
    /// Delete expired entries, or every entry when `expired_only` is false.
    /// Returns the number of entries removed.
    fn gc(&self, expired_only: bool) -> Result<usize>;
}
