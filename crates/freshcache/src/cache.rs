//! The caching facade
//!
//! [`Cache`] hashes caller keys, snapshots dependencies, packs envelopes and
//! hands raw bytes to a [`CacheStore`]. It treats the store as best effort:
//! backend failures become misses on reads and `false` on writes. Only
//! configuration mistakes and unserializable values reach the caller as
//! errors.

use std::{collections::HashMap, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    config::CacheConfig,
    dependency::{Dependency, DependencyContext},
    envelope::{Envelope, EnvelopeCodec},
    keyspace::KeySpace,
    metrics::{CacheMetrics, CacheStats, OperationTimer},
    store::CacheStore,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Set,
    Add,
}

impl WriteMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Add => "add",
        }
    }
}

/// Store-agnostic cache with dependency-driven invalidation
pub struct Cache {
    store: Arc<dyn CacheStore>,
    key_space: KeySpace,
    codec: EnvelopeCodec,
    context: DependencyContext,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
}

impl Cache {
    /// Create a cache over `store` with the default configuration
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    pub fn with_config(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            key_space: config.key_space(),
            codec: config.codec(),
            context: DependencyContext::new(),
            config,
            metrics: Arc::new(CacheMetrics::new()),
        }
    }

    /// Set the collaborators dependencies are evaluated against
    pub fn with_context(mut self, context: DependencyContext) -> Self {
        self.context = context;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.key_space
    }

    pub fn context(&self) -> &DependencyContext {
        &self.context
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    /// Retrieve a value.
    ///
    /// `Ok(None)` covers absent, expired, malformed, dependency-invalidated
    /// and unreachable-store cases alike.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let timer = OperationTimer::start();
        let physical = self.key_space.physical_key(key);

        let payload = match self.store.get_raw(&physical) {
            Ok(payload) => payload,
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                warn!("Cache lookup error for key {}: {}", key, e);
                self.record(|m| m.record_store_error());
                None
            }
        };

        self.decode(key, payload, &timer)
    }

    /// Retrieve several values; every key appears in the result.
    ///
    /// Entries are decoded and checked independently, so one bad entry only
    /// turns that key into a miss.
    pub fn mget<T: DeserializeOwned>(&self, keys: &[&str]) -> Result<HashMap<String, Option<T>>> {
        let timer = OperationTimer::start();
        let physical = self.key_space.physical_keys(keys.iter().copied());

        let payloads = match self.store.get_many_raw(&physical) {
            Ok(payloads) => payloads,
            Err(e) if e.is_configuration() => return Err(e),
            Err(e) => {
                warn!("Cache batch lookup error for {} keys: {}", keys.len(), e);
                self.record(|m| m.record_store_error());
                HashMap::new()
            }
        };

        let mut values = HashMap::with_capacity(keys.len());
        for (key, physical) in keys.iter().zip(&physical) {
            let value = self.decode(key, payloads.get(physical).cloned(), &timer)?;
            values.insert((*key).to_string(), value);
        }
        Ok(values)
    }

    /// Whether a usable value is cached under `key`
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get::<serde_json::Value>(key)?.is_some())
    }

    /// Store a value, replacing any previous one.
    ///
    /// `ttl` of `None` uses the configured default; `Some(0)` never expires.
    pub fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
        dependency: Option<Dependency>,
    ) -> Result<bool> {
        self.write(WriteMode::Set, key, value, ttl, dependency)
    }

    /// Store a value only if nothing usable is stored under `key` yet
    pub fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
        dependency: Option<Dependency>,
    ) -> Result<bool> {
        self.write(WriteMode::Add, key, value, ttl, dependency)
    }

    /// Return the cached value or compute, store and return a fresh one
    pub fn get_or_insert_with<T, F>(
        &self,
        key: &str,
        ttl: Option<u64>,
        dependency: Option<Dependency>,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        if let Some(cached) = self.get(key)? {
            return Ok(cached);
        }
        let value = compute();
        if !self.set(key, &value, ttl, dependency)? {
            debug!("Computed value for key {} was not cached", key);
        }
        Ok(value)
    }

    /// Remove a value
    pub fn delete(&self, key: &str) -> bool {
        let physical = self.key_space.physical_key(key);
        match self.store.delete_raw(&physical) {
            Ok(deleted) => {
                debug!("Deleted cache entry for key: {}", key);
                deleted
            }
            Err(e) => {
                warn!("Failed to delete cache entry for key {}: {}", key, e);
                self.record(|m| m.record_store_error());
                false
            }
        }
    }

    /// Remove every value held by the store
    pub fn flush(&self) -> bool {
        match self.store.flush_raw() {
            Ok(flushed) => {
                debug!("Flushed cache store");
                flushed
            }
            Err(e) => {
                warn!("Failed to flush cache store: {}", e);
                self.record(|m| m.record_store_error());
                false
            }
        }
    }

    fn write<T: Serialize + ?Sized>(
        &self,
        mode: WriteMode,
        key: &str,
        value: &T,
        ttl: Option<u64>,
        dependency: Option<Dependency>,
    ) -> Result<bool> {
        let timer = OperationTimer::start();

        let dependency = match dependency {
            Some(mut dependency) => match dependency.evaluate(&self.context) {
                Ok(()) => Some(dependency),
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => {
                    warn!("Skipping cache {} for key {}: {}", mode.as_str(), key, e);
                    return Ok(false);
                }
            },
            None => None,
        };

        let payload = self.codec.pack(&Envelope::wrap(value, dependency)?)?;
        let physical = self.key_space.physical_key(key);
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        let result = match mode {
            WriteMode::Set => self.store.set_raw(&physical, &payload, ttl),
            WriteMode::Add => self.store.add_raw(&physical, &payload, ttl),
        };

        match result {
            Ok(stored) => {
                if stored {
                    self.record(|m| m.record_write(timer.elapsed(), payload.len()));
                    debug!(
                        "Cached value for key: {} ({} bytes, ttl {}s)",
                        key,
                        payload.len(),
                        ttl
                    );
                } else {
                    debug!("Cache {} declined for key: {}", mode.as_str(), key);
                }
                Ok(stored)
            }
            Err(e) if e.is_configuration() => Err(e),
            Err(e) => {
                warn!("Cache {} failed for key {}: {}", mode.as_str(), key, e);
                self.record(|m| m.record_store_error());
                Ok(false)
            }
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        key: &str,
        payload: Option<Vec<u8>>,
        timer: &OperationTimer,
    ) -> Result<Option<T>> {
        let Some(bytes) = payload else {
            debug!("Cache miss for key: {}", key);
            return Ok(self.miss(timer));
        };

        let Some(envelope) = self.codec.unpack(&bytes) else {
            debug!("Malformed cache payload for key: {}", key);
            self.record(|m| m.record_malformed());
            return Ok(self.miss(timer));
        };

        if let Some(dependency) = &envelope.dependency {
            match dependency.has_changed(&self.context) {
                Ok(false) => {}
                Ok(true) => {
                    debug!(
                        "Dependency {} changed for key: {}",
                        dependency.spec().kind_name(),
                        key
                    );
                    self.record(|m| m.record_invalidation());
                    return Ok(self.miss(timer));
                }
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) => {
                    warn!("Dependency check failed for key {}: {}", key, e);
                    return Ok(self.miss(timer));
                }
            }
        }

        match envelope.value_as::<T>() {
            Some(value) => {
                debug!("Cache hit for key: {}", key);
                self.record(|m| m.record_hit(timer.elapsed()));
                Ok(Some(value))
            }
            None => {
                debug!("Cached value for key {} does not fit the requested type", key);
                Ok(self.miss(timer))
            }
        }
    }

    fn miss<T>(&self, timer: &OperationTimer) -> Option<T> {
        self.record(|m| m.record_miss(timer.elapsed()));
        None
    }

    fn record(&self, update: impl FnOnce(&CacheMetrics)) {
        if self.config.enable_metrics {
            update(&self.metrics);
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("key_space", &self.key_space)
            .field("codec", &self.codec)
            .field("context", &self.context)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder pattern for cache construction
#[derive(Default)]
pub struct CacheBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn CacheStore>>,
    context: DependencyContext,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the backing store (required)
    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn context(mut self, context: DependencyContext) -> Self {
        self.context = context;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = Some(prefix.into());
        self
    }

    pub fn default_ttl(mut self, ttl_secs: u64) -> Self {
        self.config.default_ttl = ttl_secs;
        self
    }

    /// Build the cache
    pub fn build(self) -> Result<Cache> {
        let store = self
            .store
            .ok_or_else(|| crate::CacheError::configuration("a cache store is required"))?;
        Ok(Cache::with_config(store, self.config).with_context(self.context))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::{
        clock::ManualClock,
        dependency::{DependencySpec, SharedGlobalState},
        keyspace::PhysicalKey,
        store::{MemoryStore, NullStore},
        CacheError,
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        id: u32,
        rows: Vec<String>,
    }

    /// Store whose every operation fails as if the backend were down
    struct DownStore;

    impl CacheStore for DownStore {
        fn get_raw(&self, _key: &PhysicalKey) -> Result<Option<Vec<u8>>> {
            Err(CacheError::store("connection refused"))
        }

        fn set_raw(&self, _key: &PhysicalKey, _payload: &[u8], _ttl: u64) -> Result<bool> {
            Err(CacheError::store("connection refused"))
        }

        fn add_raw(&self, _key: &PhysicalKey, _payload: &[u8], _ttl: u64) -> Result<bool> {
            Err(CacheError::store("connection refused"))
        }

        fn delete_raw(&self, _key: &PhysicalKey) -> Result<bool> {
            Err(CacheError::store("connection refused"))
        }

        fn flush_raw(&self) -> Result<bool> {
            Err(CacheError::store("connection refused"))
        }
    }

    fn memory_cache() -> (Cache, Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = MemoryStore::with_clock(clock.clone());
        let cache = CacheBuilder::new()
            .store(Arc::new(store.clone()))
            .key_prefix("tests")
            .build()
            .unwrap();
        (cache, clock, store)
    }

    #[test]
    fn test_cache_basic_operations() {
        let (cache, _, _) = memory_cache();
        let report = Report {
            id: 7,
            rows: vec!["a".into(), "b".into()],
        };

        assert!(cache.set("report:7", &report, None, None).unwrap());
        assert_eq!(cache.get::<Report>("report:7").unwrap(), Some(report));
        assert!(cache.contains("report:7").unwrap());
        assert!(!cache.contains("report:8").unwrap());

        assert!(cache.delete("report:7"));
        assert_eq!(cache.get::<Report>("report:7").unwrap(), None);
    }

    #[test]
    fn test_cache_with_ttl() {
        let (cache, clock, _) = memory_cache();
        cache.set("k", "v", Some(1), None).unwrap();
        assert_eq!(cache.get::<String>("k").unwrap(), Some("v".to_string()));

        clock.advance(2);
        assert_eq!(cache.get::<String>("k").unwrap(), None);
    }

    #[test]
    fn test_default_ttl_applies_when_none_given() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = CacheBuilder::new()
            .store(Arc::new(MemoryStore::with_clock(clock.clone())))
            .default_ttl(10)
            .build()
            .unwrap();

        cache.set("default", &1, None, None).unwrap();
        cache.set("forever", &2, Some(0), None).unwrap();
        clock.advance(11);

        assert_eq!(cache.get::<i32>("default").unwrap(), None);
        assert_eq!(cache.get::<i32>("forever").unwrap(), Some(2));
    }

    #[test]
    fn test_add_keeps_first_value() {
        let (cache, _, _) = memory_cache();
        assert!(cache.add("k", "v1", None, None).unwrap());
        assert!(!cache.add("k", "v2", None, None).unwrap());
        assert_eq!(cache.get::<String>("k").unwrap(), Some("v1".to_string()));
    }

    #[test]
    fn test_dependency_wins_over_never_expires() {
        let state = Arc::new(SharedGlobalState::new());
        state.set_state("catalog_version", json!(1));
        let (cache, _, _) = memory_cache();
        let cache = cache.with_context(DependencyContext::new().with_global_state(state.clone()));

        cache
            .set("catalog", &vec![1, 2, 3], Some(0), Some(Dependency::global_state("catalog_version")))
            .unwrap();
        assert_eq!(cache.get::<Vec<i32>>("catalog").unwrap(), Some(vec![1, 2, 3]));

        state.set_state("catalog_version", json!(2));
        assert_eq!(cache.get::<Vec<i32>>("catalog").unwrap(), None);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_mget_reports_every_key() {
        let (cache, _, _) = memory_cache();
        cache.set("k2", "value2", None, None).unwrap();

        let values = cache.mget::<String>(&["k1", "k2", "k3"]).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values["k1"], None);
        assert_eq!(values["k2"], Some("value2".to_string()));
        assert_eq!(values["k3"], None);
    }

    #[test]
    fn test_mget_with_repeated_keys() {
        let (cache, _, _) = memory_cache();
        cache.set("k", &1, None, None).unwrap();

        let values = cache.mget::<i32>(&["k", "missing", "k"]).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["k"], Some(1));
        assert_eq!(values["missing"], None);
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        let (cache, _, _) = memory_cache();

        let err = cache.set("f", &f64::NAN, None, None).unwrap_err();
        assert!(matches!(err, CacheError::Serialization { .. }));
        assert!(cache.add("f", &vec![1.0, f64::INFINITY], None, None).is_err());
        assert_eq!(cache.get::<f64>("f").unwrap(), None);

        assert!(cache.set("f", &1.25f64, None, None).unwrap());
        assert_eq!(cache.get::<f64>("f").unwrap(), Some(1.25));
    }

    #[test]
    fn test_mget_isolates_bad_entries() {
        let state = Arc::new(SharedGlobalState::new());
        state.set_state("revision", json!("a"));
        let (cache, _, store) = memory_cache();
        let cache = cache.with_context(DependencyContext::new().with_global_state(state.clone()));

        cache.set("good", &1, None, None).unwrap();
        cache
            .set("stale", &2, None, Some(Dependency::global_state("revision")))
            .unwrap();
        state.set_state("revision", json!("b"));
        store
            .set_raw(&cache.key_space().physical_key("corrupt"), b"\x00garbage", 0)
            .unwrap();

        let values = cache.mget::<i32>(&["good", "corrupt", "stale"]).unwrap();
        assert_eq!(values["good"], Some(1));
        assert_eq!(values["corrupt"], None);
        assert_eq!(values["stale"], None);
    }

    #[test]
    fn test_malformed_payload_is_a_miss() {
        let (cache, _, store) = memory_cache();
        store
            .set_raw(&cache.key_space().physical_key("k"), b"not an envelope", 0)
            .unwrap();

        assert_eq!(cache.get::<String>("k").unwrap(), None);
        assert_eq!(cache.stats().malformed, 1);
    }

    #[test]
    fn test_type_mismatch_is_a_miss() {
        let (cache, _, _) = memory_cache();
        cache.set("k", "text", None, None).unwrap();
        assert_eq!(cache.get::<Report>("k").unwrap(), None);
    }

    #[test]
    fn test_configuration_errors_propagate() {
        let (cache, _, _) = memory_cache();

        let err = cache
            .set("k", "v", None, Some(Dependency::from_spec(DependencySpec::FileTimestamp { path: None })))
            .unwrap_err();
        assert!(err.is_configuration());

        let err = cache
            .add("k", "v", None, Some(Dependency::expression("unregistered")))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_configuration_error_on_read_propagates() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let writer = Cache::with_config(
            Arc::clone(&store),
            CacheConfig {
                key_prefix: Some("shared".into()),
                ..Default::default()
            },
        )
        .with_context(DependencyContext::new().with_expression("build", || json!("1.0")));
        let reader = Cache::with_config(
            store,
            CacheConfig {
                key_prefix: Some("shared".into()),
                ..Default::default()
            },
        );

        writer
            .set("k", "v", None, Some(Dependency::expression("build")))
            .unwrap();
        assert!(reader.get::<String>("k").unwrap_err().is_configuration());
        assert_eq!(writer.get::<String>("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_store_failures_are_best_effort() {
        let cache = Cache::new(Arc::new(DownStore));

        assert!(!cache.set("k", "v", None, None).unwrap());
        assert!(!cache.add("k", "v", None, None).unwrap());
        assert_eq!(cache.get::<String>("k").unwrap(), None);
        assert!(cache.mget::<String>(&["a", "b"]).unwrap().values().all(Option::is_none));
        assert!(!cache.delete("k"));
        assert!(!cache.flush());
        assert_eq!(cache.stats().store_errors, 6);
    }

    #[test]
    fn test_flush_drops_everything() {
        let (cache, _, _) = memory_cache();
        cache.set("a", &1, None, None).unwrap();
        cache.set("b", &2, None, None).unwrap();

        assert!(cache.flush());
        assert_eq!(cache.get::<i32>("a").unwrap(), None);
        assert_eq!(cache.get::<i32>("b").unwrap(), None);
    }

    #[test]
    fn test_get_or_insert_with_computes_once() {
        let (cache, _, _) = memory_cache();
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            "expensive".to_string()
        };

        let first: String = cache.get_or_insert_with("k", None, None, compute).unwrap();
        let second: String = cache
            .get_or_insert_with("k", None, None, || "recomputed".to_string())
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_metrics() {
        let (cache, _, _) = memory_cache();

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);

        let _ = cache.get::<String>("nonexistent").unwrap();
        assert_eq!(cache.stats().misses, 1);

        cache.set("key1", "value1", None, None).unwrap();
        let _ = cache.get::<String>("key1").unwrap();
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.writes, 1);
    }

    #[test]
    fn test_metrics_can_be_disabled() {
        let cache = Cache::with_config(
            Arc::new(MemoryStore::new()),
            CacheConfig {
                enable_metrics: false,
                ..Default::default()
            },
        );
        cache.set("k", "v", None, None).unwrap();
        let _ = cache.get::<String>("k").unwrap();

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.writes, 0);
    }

    #[test]
    fn test_null_store_disables_caching() {
        let cache = Cache::new(Arc::new(NullStore));
        assert!(cache.set("k", "v", None, None).unwrap());
        assert_eq!(cache.get::<String>("k").unwrap(), None);
    }

    #[test]
    fn test_builder_requires_store() {
        assert!(CacheBuilder::new().build().unwrap_err().is_configuration());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let shop = CacheBuilder::new()
            .store(Arc::clone(&store))
            .key_prefix("shop")
            .build()
            .unwrap();
        let blog = CacheBuilder::new()
            .store(store)
            .key_prefix("blog")
            .build()
            .unwrap();

        shop.set("home", "shop page", None, None).unwrap();
        assert_eq!(blog.get::<String>("home").unwrap(), None);
    }
}
