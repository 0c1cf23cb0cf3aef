//! Integration tests against a live Postgres instance.
//!
//! Gated behind the `pg-tests` feature; `TRELLIS_TEST_DB_URL` must point
//! at a scratch database the tests may create and drop schemas in:
//!
//!   TRELLIS_TEST_DB_URL=postgres://trellis@localhost/trellis_test \
//!       cargo test --features pg-tests
//!
//! Tests serialize on a process-wide lock because they share the global
//! schema bootstrap.

#![cfg(feature = "pg-tests")]

use serde_json::{json, Map};
use sqlx::PgPool;
use std::sync::{Arc, Mutex, MutexGuard};
use trellis_commons::{DataError, Row, SchemaName};
use trellis_data::{Access, AccessorRegistry, Credentials, Scope};
use trellis_gateway::{DataService, GatewayConfig};
use trellis_live::{ChangeConsumer, ChangeEvent, InvalidationEngine, InvalidationRegistry};
use trellis_schema::{SchemaConfig, SchemaCoordinator, SchemaManager};
use trellis_store::Database;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn serialize_tests() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn database() -> Database {
    let url = std::env::var("TRELLIS_TEST_DB_URL")
        .expect("TRELLIS_TEST_DB_URL must point at a scratch database");
    let pool = PgPool::connect(&url).await.expect("cannot connect to test database");
    Database::from_pool(pool)
}

fn manager(db: &Database) -> SchemaManager {
    SchemaManager::new(
        db.clone(),
        Arc::new(AccessorRegistry::standard()),
        InvalidationRegistry::standard(),
        SchemaConfig::default(),
    )
}

/// Unique live schema name per test so leftovers from a crashed run never
/// collide with the next one.
fn test_schema(tag: &str) -> SchemaName {
    let name = format!("it_{}_{}", tag, std::process::id());
    SchemaName::parse(&name).expect("generated test schema name is valid")
}

async fn recreate(manager: &SchemaManager, schema: &SchemaName) {
    manager.delete_schema(schema).await.expect("cleanup of live name");
    manager.delete_schema(&schema.retired()).await.expect("cleanup of retired name");
    manager.create_schema(schema).await.expect("create_schema");
}

#[tokio::test]
async fn test_schema_lifecycle_round_trip() {
    let _guard = serialize_tests();
    let db = database().await;
    let manager = manager(&db);
    manager.bootstrap().await.expect("bootstrap");

    let schema = test_schema("lifecycle");
    recreate(&manager, &schema).await;
    assert!(manager.schema_exists(&schema).await.unwrap());

    // Fresh namespaces start at the registry's declared version with a
    // random hex signature.
    let version = manager.version(&schema).await.unwrap();
    assert_eq!(
        version,
        manager.registry().max_version(Scope::Project)
    );
    let signature = manager.signature(&schema).await.unwrap();
    assert_eq!(signature.len(), 32);
    assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));

    // Retire parks the namespace under the prefix; restore brings it back.
    manager.retire_schema(&schema).await.unwrap();
    assert!(!manager.schema_exists(&schema).await.unwrap());
    assert!(manager.schema_exists(&schema.retired()).await.unwrap());
    // Redelivered retire event is a no-op
    manager.retire_schema(&schema).await.unwrap();

    manager.restore_schema(&schema).await.unwrap();
    assert!(manager.schema_exists(&schema).await.unwrap());
    assert!(!manager.schema_exists(&schema.retired()).await.unwrap());

    // Rename refreshes the signature
    let restored_signature = manager.signature(&schema).await.unwrap();
    assert_ne!(signature, restored_signature);

    manager.delete_schema(&schema).await.unwrap();
    assert!(!manager.schema_exists(&schema).await.unwrap());
}

#[tokio::test]
async fn test_upgrade_rolls_old_namespace_forward() {
    let _guard = serialize_tests();
    let db = database().await;
    let manager = manager(&db);
    manager.bootstrap().await.expect("bootstrap");

    let schema = test_schema("upgrade");
    recreate(&manager, &schema).await;

    // Rewind the namespace to version 1: drop the column the v2 jump adds
    // and reset the recorded version.
    sqlx::query(&format!(
        "ALTER TABLE {}.\"story\" DROP COLUMN \"tags\"",
        schema.quoted()
    ))
    .execute(db.pool())
    .await
    .unwrap();
    sqlx::query(&format!("UPDATE {}.\"meta\" SET version = 1", schema.quoted()))
        .execute(db.pool())
        .await
        .unwrap();
    let signature_before = manager.signature(&schema).await.unwrap();

    manager.upgrade(&schema).await.unwrap();

    let (column,): (Option<String>,) = sqlx::query_as(
        "SELECT MAX(column_name) FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = 'story' AND column_name = 'tags'",
    )
    .bind(schema.as_str())
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(column.as_deref(), Some("tags"));
    assert_eq!(
        manager.version(&schema).await.unwrap(),
        manager.registry().max_version(Scope::Project)
    );
    assert_ne!(manager.signature(&schema).await.unwrap(), signature_before);

    // Already-current namespaces upgrade to a no-op
    manager.upgrade(&schema).await.unwrap();

    manager.delete_schema(&schema).await.unwrap();
}

#[tokio::test]
async fn test_stale_generation_is_a_conflict() {
    let _guard = serialize_tests();
    let db = database().await;
    let manager = manager(&db);
    manager.bootstrap().await.expect("bootstrap");

    let schema = test_schema("stale");
    recreate(&manager, &schema).await;

    let registry = AccessorRegistry::standard();
    let story = registry.get("story").unwrap();

    let mut tx = db.begin().await.unwrap();
    let object = Row::from_value(json!({
        "type": "post", "user_ids": [7], "published": false
    }))
    .unwrap();
    let saved = story.save(&mut tx, &schema, &[object]).await.unwrap();
    tx.commit().await.unwrap();
    let id = saved[0].id().expect("insert assigns an id");
    assert_eq!(saved[0].gn(), Some(1));

    // A matching generation updates and bumps
    let mut tx = db.begin().await.unwrap();
    let object = Row::from_value(json!({"id": id, "gn": 1, "published": true})).unwrap();
    let saved = story.save(&mut tx, &schema, &[object]).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(saved[0].gn(), Some(2));

    // Replaying the already-consumed generation conflicts
    let mut tx = db.begin().await.unwrap();
    let object = Row::from_value(json!({"id": id, "gn": 1, "published": false})).unwrap();
    let err = story.save(&mut tx, &schema, &[object]).await.unwrap_err();
    drop(tx);
    assert!(matches!(err, DataError::StaleGeneration { .. }));
    assert_eq!(err.status_code(), 409);

    // The conflicting write left no trace
    let (published,): (bool,) = sqlx::query_as(&format!(
        "SELECT \"published\" FROM {}.\"story\" WHERE \"id\" = $1",
        schema.quoted()
    ))
    .bind(id)
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert!(published);

    manager.delete_schema(&schema).await.unwrap();
}

#[tokio::test]
async fn test_unprovisioned_schema_is_not_found() {
    let _guard = serialize_tests();
    let db = database().await;
    let manager = Arc::new(manager(&db));
    manager.bootstrap().await.expect("bootstrap");

    let schema = test_schema("absent");
    manager.delete_schema(&schema).await.unwrap();
    manager.delete_schema(&schema.retired()).await.unwrap();

    let err = manager.signature(&schema).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(err.is_missing_schema());

    // The gateway reports the same 404 on every entry point, not just
    // discovery.
    let service = DataService::new(
        db.clone(),
        Arc::new(AccessorRegistry::standard()),
        Arc::clone(&manager),
        GatewayConfig::default(),
    );
    let credentials = Credentials {
        user_id: 7,
        project_id: Some(1),
        access: Access::Write,
        unrestricted: false,
        area: "client".to_string(),
    };
    let err = service.signature(&schema, &credentials).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
    let err = service
        .retrieve(&schema, "story", &credentials, vec![1], &Map::new())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_undelete_with_rename_restores_under_the_new_name() {
    let _guard = serialize_tests();
    let db = database().await;
    let manager = Arc::new(manager(&db));
    manager.bootstrap().await.expect("bootstrap");

    let old = test_schema("combo_a");
    let new = test_schema("combo_b");
    for schema in [&old, &new] {
        manager.delete_schema(schema).await.unwrap();
        manager.delete_schema(&schema.retired()).await.unwrap();
    }
    manager.create_schema(&old).await.unwrap();
    manager.retire_schema(&old).await.unwrap();

    // One project update carries both the undelete and the rename; the
    // parked schema comes back under the new name.
    let event = ChangeEvent::parse(&json!({
        "op": "UPDATE",
        "schema": "global",
        "table": "project",
        "current": {"id": 1, "gn": 3, "deleted": false, "name": new.as_str()},
        "previous": {"deleted": true, "name": old.as_str()}
    }))
    .unwrap();
    let coordinator = SchemaCoordinator::new(Arc::clone(&manager));
    coordinator.consume(SchemaName::global(), vec![event]).await;

    assert!(manager.schema_exists(&new).await.unwrap());
    assert!(!manager.schema_exists(&old).await.unwrap());
    assert!(!manager.schema_exists(&old.retired()).await.unwrap());
    assert!(!manager.schema_exists(&new.retired()).await.unwrap());

    manager.delete_schema(&new).await.unwrap();
}

async fn dirty_state(db: &Database, schema: &SchemaName, id: i64) -> bool {
    let (dirty,): (bool,) = sqlx::query_as(&format!(
        "SELECT \"dirty\" FROM {}.\"statistics\" WHERE \"id\" = $1",
        schema.quoted()
    ))
    .bind(id)
    .fetch_one(db.pool())
    .await
    .unwrap();
    dirty
}

#[tokio::test]
async fn test_publish_flip_marks_matching_statistics_dirty() {
    let _guard = serialize_tests();
    let db = database().await;
    let manager = manager(&db);
    manager.bootstrap().await.expect("bootstrap");

    let schema = test_schema("invalidation");
    recreate(&manager, &schema).await;

    let insert = format!(
        "INSERT INTO {}.\"statistics\" (\"type\", \"filters\", \"dirty\") \
         VALUES ($1, $2, false) RETURNING \"id\"",
        schema.quoted()
    );
    let insert_stat = |kind: &'static str, filters: serde_json::Value| {
        let insert = insert.clone();
        let pool = db.pool().clone();
        async move {
            let (id,): (i64,) = sqlx::query_as(&insert)
                .bind(kind)
                .bind(filters)
                .fetch_one(&pool)
                .await
                .unwrap();
            id
        }
    };
    let date_range = insert_stat("story-date-range", json!({})).await;
    let author_7 = insert_stat("daily-activities", json!({"user_ids": [7]})).await;
    let author_99 = insert_stat("daily-activities", json!({"user_ids": [99]})).await;

    // A story by author 7 flips published false -> true
    let event = ChangeEvent::parse(&json!({
        "op": "UPDATE",
        "schema": schema.as_str(),
        "table": "story",
        "current": {
            "id": 1, "gn": 2, "deleted": false, "type": "post",
            "published": true, "ready": true, "public": true,
            "user_ids": [7], "tags": [], "ptime": null
        },
        "previous": {"published": false}
    }))
    .unwrap();

    let engine = InvalidationEngine::new(db.clone(), InvalidationRegistry::standard());
    engine.consume(schema.clone(), vec![event.clone()]).await;

    // The project-wide row and the matching author bucket go dirty; the
    // non-overlapping bucket stays clean.
    assert!(dirty_state(&db, &schema, date_range).await);
    assert!(dirty_state(&db, &schema, author_7).await);
    assert!(!dirty_state(&db, &schema, author_99).await);

    // Redelivery of the same event changes nothing
    engine.consume(schema.clone(), vec![event]).await;
    assert!(dirty_state(&db, &schema, date_range).await);
    assert!(dirty_state(&db, &schema, author_7).await);
    assert!(!dirty_state(&db, &schema, author_99).await);

    manager.delete_schema(&schema).await.unwrap();
}
