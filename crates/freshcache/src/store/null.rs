//! Store that keeps nothing
//!
//! Useful to switch caching off without touching call sites: every write
//! reports success and every read misses.

use super::CacheStore;
use crate::{keyspace::PhysicalKey, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl CacheStore for NullStore {
    fn get_raw(&self, _key: &PhysicalKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn set_raw(&self, _key: &PhysicalKey, _payload: &[u8], _ttl_secs: u64) -> Result<bool> {
        Ok(true)
    }

    fn add_raw(&self, _key: &PhysicalKey, _payload: &[u8], _ttl_secs: u64) -> Result<bool> {
        Ok(true)
    }

    fn delete_raw(&self, _key: &PhysicalKey) -> Result<bool> {
        Ok(true)
    }

    fn flush_raw(&self) -> Result<bool> {
        Ok(true)
    }
}
