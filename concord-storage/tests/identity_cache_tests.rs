//! Identity Cache Integration Tests
//!
//! Every read path of a persistent cache hands out the single registered
//! instance for a primary key:
//! - concurrent misses on one key value trigger exactly one load
//! - a failed load reaches every waiter and is not cached
//! - every index view of a registered instance yields the same instance
//! - writes are visible to subsequent reads through every index

use std::sync::Arc;
use std::time::Duration;

use concord_core::{Entity, EntityModel, PersistConfig, SearchTerm, State, DEFAULT_DATASOURCE};
use concord_storage::{CacheRegistry, MemoryStorage, Storage};
use concord_test_utils::assertions::{assert_same_instance, assert_storage_error};
use concord_test_utils::fixtures::{seeded_storage, server, Server, ServerState, SERVER_ENTITY};
use concord_test_utils::{generators, init_test_tracing, FlakyStorage};
use proptest::prelude::*;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

fn registry(storage: impl Storage + 'static) -> CacheRegistry {
    CacheRegistry::new(Arc::new(storage), PersistConfig::default()).unwrap()
}

// ============================================================================
// SINGLEFLIGHT
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_gets_load_once() {
    init_test_tracing();
    let storage = FlakyStorage::new(seeded_storage(3).await);
    storage.set_load_delay(Duration::from_millis(50));
    let registry = registry(storage.clone());
    let servers = registry.cache_for::<Server>().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let servers = Arc::clone(&servers);
        tasks.push(tokio::spawn(async move { servers.get(2i64).await }));
    }
    let mut found = Vec::new();
    for task in tasks {
        found.push(task.await.unwrap().unwrap().unwrap());
    }

    assert_eq!(storage.load_attempts(), 1);
    for item in &found {
        assert_same_instance(item, &found[0]);
    }
    assert_eq!(found[0].name, "srv-2");
    assert_eq!(servers.stats().loads, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_load_reaches_every_waiter_and_is_retried() {
    init_test_tracing();
    let storage = FlakyStorage::new(seeded_storage(1).await);
    storage.set_load_delay(Duration::from_millis(30));
    storage.set_fail_loads(true);
    let registry = registry(storage.clone());
    let servers = registry.cache_for::<Server>().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let servers = Arc::clone(&servers);
        tasks.push(tokio::spawn(async move { servers.get(1i64).await }));
    }
    for task in tasks {
        assert_storage_error(&task.await.unwrap());
    }
    assert_eq!(storage.load_attempts(), 1);
    assert!(servers.cache().is_empty());

    storage.set_fail_loads(false);
    let loaded = servers.get(1i64).await.unwrap();
    assert!(loaded.is_some());
    assert_eq!(storage.load_attempts(), 2);
    assert_eq!(servers.stats().load_failures, 1);
}

#[tokio::test]
async fn test_missing_row_is_not_cached() {
    let storage = FlakyStorage::new(seeded_storage(1).await);
    let registry = registry(storage.clone());
    let servers = registry.cache_for::<Server>().unwrap();

    assert!(servers.get(99i64).await.unwrap().is_none());
    assert!(servers.get(99i64).await.unwrap().is_none());
    assert_eq!(storage.load_attempts(), 2);
}

// ============================================================================
// INDEX VIEWS
// ============================================================================

#[tokio::test]
async fn test_every_index_view_yields_the_same_instance() {
    let registry = registry(seeded_storage(4).await);
    let servers = registry.cache_for::<Server>().unwrap();
    let model = Arc::clone(servers.model());

    let by_id = servers.get(3i64).await.unwrap().unwrap();
    let by_name = servers
        .find_one(&[SearchTerm::eq("name", "srv-3")])
        .await
        .unwrap()
        .unwrap();
    assert_same_instance(&by_id, &by_name);

    let cascade = model.index().key(&["regionId", "zone"]).unwrap();
    let peeked = servers.cache().peek(cascade, "us-east:a").unwrap().unwrap();
    assert_same_instance(&by_id, &peeked);

    let state = model.index().key(&["state"]).unwrap();
    let running = servers.cache().peek_all(state, "RUNNING").unwrap();
    assert_eq!(running.len(), 1);
    assert_same_instance(&by_id, &running[0]);
}

#[tokio::test]
async fn test_list_registers_rows_already_cached() {
    let registry = registry(seeded_storage(4).await);
    let servers = registry.cache_for::<Server>().unwrap();

    let first = servers.get(1i64).await.unwrap().unwrap();
    let listed = servers.list().await.unwrap();
    assert_eq!(listed.len(), 4);
    assert_same_instance(&first, &listed[0]);
    assert_eq!(servers.cache().len(), 4);
}

// ============================================================================
// READ AFTER WRITE
// ============================================================================

#[tokio::test]
async fn test_update_is_visible_through_every_index() {
    let registry = registry(seeded_storage(2).await);
    let servers = registry.cache_for::<Server>().unwrap();
    let model = Arc::clone(servers.model());
    let original = servers.get(1i64).await.unwrap().unwrap();

    let mut tx = registry.transaction(false).await.unwrap();
    let updated = servers
        .update(
            &mut *tx,
            &original,
            State::new()
                .with("name", "gateway")
                .with("state", concord_core::FieldValue::enumeration(&ServerState::Stopped)),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let name = model.index().key(&["name"]).unwrap();
    assert!(servers.cache().peek(name, "srv-1").unwrap().is_none());
    let by_name = servers
        .find_one(&[SearchTerm::eq("name", "gateway")])
        .await
        .unwrap()
        .unwrap();
    assert_same_instance(&updated, &by_name);
    assert_same_instance(&updated, &servers.get(1i64).await.unwrap().unwrap());
    assert_eq!(updated.state, ServerState::Stopped);
}

#[tokio::test]
async fn test_create_then_remove() {
    let registry = registry(MemoryStorage::new());
    let servers = registry.cache_for::<Server>().unwrap();

    let mut tx = registry.transaction(false).await.unwrap();
    let created = servers
        .create(&mut *tx, server(10, "edge", "eu-west").to_state())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_same_instance(&created, &servers.get(10i64).await.unwrap().unwrap());

    let mut tx = registry.transaction(false).await.unwrap();
    servers.remove(&mut *tx, &created).await.unwrap();
    tx.commit().await.unwrap();

    assert!(servers.cache().is_empty());
    assert!(servers.get(10i64).await.unwrap().is_none());
    assert_eq!(servers.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rolled_back_create_leaves_storage_untouched() {
    let storage = MemoryStorage::new();
    let registry = registry(storage.clone());
    let servers = registry.cache_for::<Server>().unwrap();

    let mut tx = registry.transaction(false).await.unwrap();
    servers
        .create(&mut *tx, server(11, "scratch", "us-east").to_state())
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert!(storage.rows(DEFAULT_DATASOURCE, SERVER_ENTITY).await.is_empty());
    assert_eq!(storage.rollback_count(), 1);
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(25))]

    /// For any stored set of servers, listing registers each one so that
    /// the primary and name views resolve to the listed instance.
    #[test]
    fn prop_listed_instances_are_reachable_by_every_unique_view(
        generated in prop::collection::vec(generators::arb_server(), 1..12)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let model = EntityModel::of::<Server>().unwrap();
            let storage = MemoryStorage::new();
            let mut stored = Vec::new();
            for (i, mut item) in generated.into_iter().enumerate() {
                item.server_id = i as i64 + 1;
                item.name = format!("{}-{i}", item.name);
                storage
                    .insert_row(DEFAULT_DATASOURCE, SERVER_ENTITY, "serverId", model.to_record(&item.to_state()).unwrap())
                    .await;
                stored.push(item);
            }

            let registry = registry(storage);
            let servers = registry.cache_for::<Server>().unwrap();
            let listed = servers.list().await.unwrap();
            assert_eq!(listed.len(), stored.len());

            let primary = servers.model().primary_key().clone();
            let name = servers.model().index().key(&["name"]).unwrap().clone();
            for (item, expected) in listed.iter().zip(&stored) {
                assert_eq!(item.as_ref(), expected);
                let by_id = servers.cache().peek(&primary, &item.server_id.to_string()).unwrap().unwrap();
                let by_name = servers.cache().peek(&name, &item.name).unwrap().unwrap();
                assert_same_instance(item, &by_id);
                assert_same_instance(item, &by_name);
            }
        });
    }
}
