//! Property-based tests for dependency-driven invalidation
//!
//! These tests verify that:
//! - A chain reports a change exactly when one of its children does
//! - Dependencies persisted in an envelope are re-checked on read without
//!   being supplied again
//! - File and directory dependencies observe real file system changes

use std::{fs, sync::Arc, time::{Duration, SystemTime}};

use freshcache::{
    CacheBuilder, Dependency, DependencyContext, MemoryStore, SharedGlobalState,
};
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

proptest! {
    /// Property: Chained{children} changes iff at least one child changed
    #[test]
    fn prop_chain_is_logical_or(
        initial in prop::collection::vec(any::<u8>(), 0..6),
        mutate in prop::collection::vec(any::<bool>(), 6),
    ) {
        let state = Arc::new(SharedGlobalState::new());
        for (i, value) in initial.iter().enumerate() {
            state.set_state(format!("slot{}", i), json!(value));
        }
        let ctx = DependencyContext::new().with_global_state(state.clone());

        let children = (0..initial.len())
            .map(|i| Dependency::global_state(format!("slot{}", i)))
            .collect();
        let mut chain = Dependency::chain(children);
        chain.evaluate(&ctx).unwrap();
        prop_assert!(!chain.has_changed(&ctx).unwrap());

        let mut any_changed = false;
        for (i, value) in initial.iter().enumerate() {
            if mutate[i] {
                state.set_state(format!("slot{}", i), json!(u16::from(*value) + 1));
                any_changed = true;
            }
        }

        prop_assert_eq!(chain.has_changed(&ctx).unwrap(), any_changed);
    }

    /// Property: a read needs no dependency argument; the envelope carries it
    #[test]
    fn prop_persisted_dependency_is_rechecked(
        version in 0u32..1000,
        bump in 1u32..1000,
        value in "[a-z]{1,16}",
    ) {
        let state = Arc::new(SharedGlobalState::new());
        state.set_state("schema", json!(version));
        let cache = CacheBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .key_prefix("deps")
            .context(DependencyContext::new().with_global_state(state.clone()))
            .build()
            .unwrap();

        let dependency = Dependency::chain(vec![
            Dependency::global_state("schema"),
            Dependency::global_state("unrelated"),
        ]);
        prop_assert!(cache.set("entry", &value, Some(0), Some(dependency)).unwrap());
        prop_assert_eq!(cache.get::<String>("entry").unwrap(), Some(value));

        state.set_state("schema", json!(version + bump));
        prop_assert_eq!(cache.get::<String>("entry").unwrap(), None);
    }
}

fn touch(path: &std::path::Path, offset_secs: u64) {
    let file = fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000 + offset_secs))
        .unwrap();
}

#[test]
fn test_file_dependency_invalidates_on_touch() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("settings.toml");
    fs::write(&config, "debug = false").unwrap();
    touch(&config, 0);

    let cache = CacheBuilder::new()
        .store(Arc::new(MemoryStore::new()))
        .key_prefix("files")
        .build()
        .unwrap();

    cache
        .set("parsed", &json!({"debug": false}), None, Some(Dependency::file(&config)))
        .unwrap();
    assert!(cache.contains("parsed").unwrap());

    touch(&config, 60);
    assert!(!cache.contains("parsed").unwrap());
    assert_eq!(cache.stats().invalidations, 1);
}

#[test]
fn test_directory_dependency_sees_new_matching_files_only() {
    let temp_dir = TempDir::new().unwrap();
    let templates = temp_dir.path().join("templates");
    fs::create_dir_all(templates.join("partials")).unwrap();
    fs::write(templates.join("index.html"), "<html>").unwrap();

    let cache = CacheBuilder::new()
        .store(Arc::new(MemoryStore::new()))
        .key_prefix("dirs")
        .build()
        .unwrap();
    let dependency = Dependency::directory_with(&templates, -1, Some(r"\.html$"));

    cache.set("rendered", "page", None, Some(dependency)).unwrap();

    fs::write(templates.join("partials").join("notes.txt"), "ignored").unwrap();
    assert_eq!(cache.get::<String>("rendered").unwrap(), Some("page".to_string()));

    fs::write(templates.join("partials").join("nav.html"), "<nav>").unwrap();
    assert_eq!(cache.get::<String>("rendered").unwrap(), None);
}

#[test]
fn test_unregistered_expression_is_a_configuration_error() {
    let cache = CacheBuilder::new()
        .store(Arc::new(MemoryStore::new()))
        .key_prefix("expressions")
        .context(DependencyContext::new().with_expression("build", || json!("1.2.3")))
        .build()
        .unwrap();

    assert!(cache
        .set("ok", "v", None, Some(Dependency::expression("build")))
        .unwrap());
    let err = cache
        .set("bad", "v", None, Some(Dependency::expression("missing")))
        .unwrap_err();
    assert!(err.is_configuration());
}
