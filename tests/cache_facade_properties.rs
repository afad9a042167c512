//! Property-based tests for the cache facade
//!
//! These tests verify the facade contract over the in-memory store:
//! - A value reads back unchanged until it expires
//! - `add` never overwrites a live entry
//! - Deleted and expired entries read as misses
//! - Dependencies invalidate entries that would otherwise never expire
//! - Batch reads report every requested key
//! - Corrupted payloads decode to misses instead of errors

use std::{collections::HashMap, sync::Arc};

use freshcache::{
    Cache, CacheBuilder, CacheStore, Dependency, DependencyContext, EnvelopeCodec, KeySpace,
    ManualClock, MemoryStore, SharedGlobalState,
};
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for generating caller keys
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9:/_ .-]{1,64}"
}

/// Strategy for generating cacheable JSON values
fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z ]{0,32}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::hash_map("[a-z]{1,8}", inner, 0..4)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

fn cache_with_clock() -> (Cache, Arc<ManualClock>, MemoryStore) {
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let store = MemoryStore::with_clock(clock.clone());
    let cache = CacheBuilder::new()
        .store(Arc::new(store.clone()))
        .key_prefix("properties")
        .build()
        .unwrap();
    (cache, clock, store)
}

proptest! {
    /// Property 1: set then get returns the stored value while the TTL holds
    #[test]
    fn prop_set_then_get_round_trips(
        key in key_strategy(),
        value in value_strategy(),
        ttl in 0u64..3600,
    ) {
        let (cache, _, _) = cache_with_clock();

        prop_assert!(cache.set(&key, &value, Some(ttl), None).unwrap());
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), Some(value));
    }

    /// Property 2: a second add is rejected and the first value survives
    #[test]
    fn prop_add_never_overwrites(
        key in key_strategy(),
        first in value_strategy(),
        second in value_strategy(),
    ) {
        let (cache, _, _) = cache_with_clock();

        prop_assert!(cache.add(&key, &first, None, None).unwrap());
        prop_assert!(!cache.add(&key, &second, None, None).unwrap());
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), Some(first));
    }

    /// Property 3: delete turns a hit into a miss
    #[test]
    fn prop_delete_removes(key in key_strategy(), value in value_strategy()) {
        let (cache, _, _) = cache_with_clock();

        cache.set(&key, &value, None, None).unwrap();
        prop_assert!(cache.delete(&key));
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), None);
    }

    /// Property 4: entries expire once the clock passes their TTL
    #[test]
    fn prop_ttl_expiry(
        key in key_strategy(),
        value in value_strategy(),
        ttl in 1u64..600,
        overshoot in 0u64..600,
    ) {
        let (cache, clock, _) = cache_with_clock();

        cache.set(&key, &value, Some(ttl), None).unwrap();
        clock.advance(ttl - 1);
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), Some(value));

        clock.advance(1 + overshoot);
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), None);
    }

    /// Property 5: a changed dependency beats "never expires"
    #[test]
    fn prop_dependency_wins_over_zero_ttl(
        key in key_strategy(),
        value in value_strategy(),
        before in any::<i64>(),
        after in any::<i64>(),
    ) {
        let state = Arc::new(SharedGlobalState::new());
        state.set_state("revision", json!(before));
        let (cache, _, _) = cache_with_clock();
        let cache = cache.with_context(DependencyContext::new().with_global_state(state.clone()));

        cache
            .set(&key, &value, Some(0), Some(Dependency::global_state("revision")))
            .unwrap();
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), Some(value.clone()));

        state.set_state("revision", json!(after));
        let expected = if before == after { Some(value) } else { None };
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), expected);
    }

    /// Property 6: mget reports a miss for every absent key and a hit for every present one
    #[test]
    fn prop_mget_reports_every_key(
        entries in prop::collection::hash_map(key_strategy(), value_strategy(), 0..8),
        absent in prop::collection::hash_set(key_strategy(), 0..8),
    ) {
        let (cache, _, _) = cache_with_clock();
        for (key, value) in &entries {
            cache.set(key, value, None, None).unwrap();
        }

        let absent: Vec<&String> = absent.iter().filter(|k| !entries.contains_key(*k)).collect();
        let requested: Vec<&str> = entries
            .keys()
            .chain(absent.iter().copied())
            .map(String::as_str)
            .collect();

        let values: HashMap<String, Option<Value>> = cache.mget(&requested).unwrap();
        prop_assert_eq!(values.len(), requested.len());
        for (key, value) in &entries {
            prop_assert_eq!(values[key].as_ref(), Some(value));
        }
        for key in absent {
            prop_assert_eq!(values[key].as_ref(), None);
        }
    }

    /// Property 7: arbitrary bytes never raise when unpacked or read back
    #[test]
    fn prop_corrupted_bytes_are_misses(
        key in key_strategy(),
        garbage in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let (cache, _, store) = cache_with_clock();
        let codec = EnvelopeCodec::new();
        let physical = KeySpace::new("properties").physical_key(&key);

        prop_assert!(codec.unpack(&garbage).is_none());
        store.set_raw(&physical, &garbage, 0).unwrap();
        prop_assert_eq!(cache.get::<Value>(&key).unwrap(), None);
    }

    /// Property 8: physical keys are fixed-length hex and namespace-dependent
    #[test]
    fn prop_physical_keys_are_namespaced(
        key in key_strategy(),
        first in "[a-z]{1,8}",
        second in "[a-z]{1,8}",
    ) {
        let a = KeySpace::new(first.clone()).physical_key(&key);
        let b = KeySpace::new(second.clone()).physical_key(&key);

        prop_assert_eq!(a.as_str().len(), 64);
        prop_assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(a == b, first == second);
    }
}

#[test]
fn test_truncated_envelope_reads_as_miss() {
    let (cache, _, store) = cache_with_clock();
    cache.set("report", &json!({"rows": [1, 2, 3]}), None, None).unwrap();

    let physical = cache.key_space().physical_key("report");
    let payload = store.get_raw(&physical).unwrap().unwrap();
    store
        .set_raw(&physical, &payload[..payload.len() / 2], 0)
        .unwrap();

    assert_eq!(cache.get::<Value>("report").unwrap(), None);
    assert_eq!(cache.stats().malformed, 1);
}

#[test]
fn test_large_values_survive_compression() {
    let clock = Arc::new(ManualClock::new(0));
    let store = MemoryStore::with_clock(clock);
    let cache = Cache::with_config(
        Arc::new(store),
        freshcache::CacheConfig {
            key_prefix: Some("compressed".to_string()),
            compression_threshold: Some(64),
            ..Default::default()
        },
    );

    let rows: Vec<String> = (0..500).map(|i| format!("row {}", i)).collect();
    assert!(cache.set("rows", &rows, None, None).unwrap());
    assert_eq!(cache.get::<Vec<String>>("rows").unwrap(), Some(rows));
    assert!(cache.stats().last_payload_bytes < 500 * 8);
}
