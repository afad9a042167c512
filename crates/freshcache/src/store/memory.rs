//! In-process store shared by every handle cloned from it

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use super::CacheStore;
use crate::{
    clock::{Clock, SystemClock},
    keyspace::PhysicalKey,
    Result,
};

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: Vec<u8>,
    expires_at: u64,
}

/// In-memory cache storage with lazy expiry
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Arc<RwLock<HashMap<PhysicalKey, MemoryEntry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create new in-memory storage
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create with initial capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::with_capacity(capacity))),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Number of stored entries, expired ones included until they are read
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn entry(&self, payload: &[u8], ttl_secs: u64) -> MemoryEntry {
        MemoryEntry {
            payload: payload.to_vec(),
            expires_at: self.clock.expires_at(ttl_secs),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryStore {
    fn get_raw(&self, key: &PhysicalKey) -> Result<Option<Vec<u8>>> {
        {
            let data = self.data.read();
            match data.get(key) {
                None => return Ok(None),
                Some(entry) if !self.clock.is_expired(entry.expires_at) => {
                    return Ok(Some(entry.payload.clone()));
                }
                Some(_) => {}
            }
        }

        // Expired: drop it unless a writer replaced it in the meantime
        let mut data = self.data.write();
        if data
            .get(key)
            .is_some_and(|entry| self.clock.is_expired(entry.expires_at))
        {
            data.remove(key);
        }
        Ok(None)
    }

    fn get_many_raw(&self, keys: &[PhysicalKey]) -> Result<HashMap<PhysicalKey, Vec<u8>>> {
        let data = self.data.read();
        Ok(keys
            .iter()
            .filter_map(|key| {
                data.get(key)
                    .filter(|entry| !self.clock.is_expired(entry.expires_at))
                    .map(|entry| (key.clone(), entry.payload.clone()))
            })
            .collect())
    }

    fn set_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        let entry = self.entry(payload, ttl_secs);
        self.data.write().insert(key.clone(), entry);
        Ok(true)
    }

    fn add_raw(&self, key: &PhysicalKey, payload: &[u8], ttl_secs: u64) -> Result<bool> {
        let mut data = self.data.write();
        if let Some(existing) = data.get(key) {
            if !self.clock.is_expired(existing.expires_at) {
                return Ok(false);
            }
        }
        data.insert(key.clone(), self.entry(payload, ttl_secs));
        Ok(true)
    }

    fn delete_raw(&self, key: &PhysicalKey) -> Result<bool> {
        self.data.write().remove(key);
        Ok(true)
    }

    fn flush_raw(&self) -> Result<bool> {
        self.data.write().clear();
        Ok(true)
    }
}
