//! End-to-end store lifecycle scenarios over the in-memory services.

use backend::{DocStore, LeaseMap};
use coffer::{Error, MigrationStep, StoreConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

mod support;
use support::{coins_config, open_store, Services};

#[tokio::test]
async fn load_update_save_reload() {
    let services = Services::new();
    let store = open_store(&services, coins_config()).await;

    store.load("p1").await.unwrap();
    assert_eq!(store.get("p1").await.unwrap(), json!({"coins": 0}));

    let committed = store
        .update("p1", |data| {
            data["coins"] = json!(10);
            true
        })
        .await
        .unwrap();
    assert!(committed);
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(10));

    // Buffered until a save: a lockless peek still sees nothing durable.
    assert_eq!(store.peek("p1").await.unwrap(), None);
    store.save("p1").await.unwrap();
    assert_eq!(
        store.peek("p1").await.unwrap().unwrap()["coins"],
        json!(10)
    );

    store.unload("p1").await.unwrap();
    store.close().await;

    // A second process over the same backing data sees the saved state.
    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(10));
    store.close().await;
}

#[tokio::test]
async fn aborting_update_is_a_no_op() {
    let services = Services::new();
    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();

    let committed = store
        .update("p1", |data| {
            data["coins"] = json!(999);
            false
        })
        .await
        .unwrap();
    assert!(!committed);
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(0));
    store.close().await;
}

#[tokio::test]
async fn schema_rejection_leaves_data_unchanged() {
    let services = Services::new();
    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();

    let err = store
        .update("p1", |data| {
            data["coins"] = json!("ten");
            true
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaFailed { .. }));
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(0));

    // The session stays Ready.
    assert!(store
        .update("p1", |data| {
            data["coins"] = json!(5);
            true
        })
        .await
        .unwrap());
    store.close().await;
}

#[tokio::test]
async fn panicking_transform_is_contained() {
    let services = Services::new();
    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();

    let err = store
        .update("p1", |_data| -> bool { panic!("bad transform") })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UpdatePanicked(_)));
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(0));
    store.close().await;
}

#[tokio::test]
async fn lifecycle_guards() {
    let services = Services::new();
    let store = open_store(&services, coins_config()).await;

    assert!(matches!(
        store.get("p1").await.unwrap_err(),
        Error::KeyNotLoaded(_)
    ));
    assert!(matches!(
        store.update("p1", |_| true).await.unwrap_err(),
        Error::KeyNotLoaded(_)
    ));
    assert!(matches!(
        store.unload("p1").await.unwrap_err(),
        Error::KeyNotLoaded(_)
    ));
    assert!(matches!(
        store.load("p/1").await.unwrap_err(),
        Error::InvalidKey(_)
    ));

    store.load("p1").await.unwrap();
    assert!(matches!(
        store.load("p1").await.unwrap_err(),
        Error::KeyAlreadyLoaded(_)
    ));

    store.close().await;
    assert!(matches!(
        store.load("p2").await.unwrap_err(),
        Error::StoreClosed
    ));
    assert!(matches!(
        store.get("p1").await.unwrap_err(),
        Error::StoreClosed
    ));
}

#[tokio::test(start_paused = true)]
async fn lock_exclusivity_across_processes() {
    let services = Services::new();
    let config = || coins_config().with_lock_duration(Duration::from_secs(30));

    let alpha = open_store(&services, config()).await;
    let beta = open_store(&services, config()).await;

    alpha.load("p1").await.unwrap();

    // The loser backs off until its acquisition deadline.
    let err = beta.load("p1").await.unwrap_err();
    assert!(matches!(err, Error::LockUnavailable(_)));

    alpha.unload("p1").await.unwrap();
    beta.load("p1").await.unwrap();
    assert_eq!(beta.get("p1").await.unwrap(), json!({"coins": 0}));

    beta.close().await;
    alpha.close().await;
}

#[tokio::test(start_paused = true)]
async fn lease_loss_poisons_the_session() {
    let services = Services::new();
    let store = open_store(
        &services,
        coins_config()
            .with_lock_duration(Duration::from_secs(30))
            .with_lock_refresh_interval(Duration::from_secs(5)),
    )
    .await;
    store.load("p1").await.unwrap();

    // Another process steals the lease out from under the session.
    let holder = services
        .leases
        .read("players/p1")
        .await
        .unwrap()
        .expect("lease held");
    services.leases.release("players/p1", &holder).await.unwrap();
    services
        .leases
        .acquire("players/p1", "intruder", Duration::from_secs(300))
        .await
        .unwrap();

    // Let the refresh task notice.
    tokio::time::sleep(Duration::from_secs(6)).await;

    let err = store.update("p1", |_| true).await.unwrap_err();
    assert!(matches!(err, Error::LockLost(_)));
    assert!(matches!(
        store.get("p1").await.unwrap_err(),
        Error::LockLost(_)
    ));

    // Unload of a lost session is a clean teardown that leaves the
    // thief's lease alone.
    store.unload("p1").await.unwrap();
    assert_eq!(
        services.leases.read("players/p1").await.unwrap().as_deref(),
        Some("intruder")
    );
    store.close().await;
}

#[tokio::test(start_paused = true)]
async fn autosave_flushes_dirty_sessions() {
    let services = Services::new();
    let store = open_store(
        &services,
        coins_config().with_autosave_interval(Duration::from_secs(30)),
    )
    .await;
    store.load("p1").await.unwrap();
    store
        .update("p1", |data| {
            data["coins"] = json!(4);
            true
        })
        .await
        .unwrap();
    assert_eq!(store.peek("p1").await.unwrap(), None);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        store.peek("p1").await.unwrap().unwrap()["coins"],
        json!(4)
    );
    store.close().await;
}

#[tokio::test]
async fn close_flushes_and_quiesces() {
    let services = Services::new();
    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();
    store
        .update("p1", |data| {
            data["coins"] = json!(12);
            true
        })
        .await
        .unwrap();

    store.close().await;

    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(12));
    store.close().await;
}

#[tokio::test]
async fn import_legacy_seeds_first_load_only() {
    let services = Services::new();
    let config = coins_config().with_import_legacy(|key: &str| {
        assert_eq!(key, "p1");
        Ok(Some(json!({"coins": 77})))
    });
    let store = open_store(&services, config).await;

    store.load("p1").await.unwrap();
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(77));
    store.unload("p1").await.unwrap();
    store.close().await;

    // The imported record is durable now; a store without the hook
    // reads it back rather than re-importing.
    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();
    assert_eq!(store.get("p1").await.unwrap()["coins"], json!(77));
    store.close().await;
}

#[tokio::test]
async fn failing_import_fails_the_load() {
    let services = Services::new();
    let config = coins_config().with_import_legacy(|_key: &str| anyhow::bail!("legacy outage"));
    let store = open_store(&services, config).await;

    let err = store.load("p1").await.unwrap_err();
    assert!(matches!(err, Error::ImportFailed { .. }));

    // The failed load released its lease and left no session behind.
    assert_eq!(services.leases.read("players/p1").await.unwrap(), None);
    assert!(matches!(
        store.get("p1").await.unwrap_err(),
        Error::KeyNotLoaded(_)
    ));
    store.close().await;
}

#[tokio::test]
async fn migrations_run_once_and_become_durable() {
    let services = Services::new();

    // Generation one: plain coins records.
    let store = open_store(&services, coins_config()).await;
    store.load("p1").await.unwrap();
    store
        .update("p1", |data| {
            data["coins"] = json!(3);
            true
        })
        .await
        .unwrap();
    store.unload("p1").await.unwrap();
    store.close().await;

    // Generation two adds an inventory.
    let migrated = || {
        coins_config().with_migration(MigrationStep::new("add-inventory", |mut data: Value| {
            data["inventory"] = json!([]);
            Ok(data)
        }))
    };
    let store = open_store(&services, migrated()).await;
    store.load("p1").await.unwrap();
    assert_eq!(
        store.get("p1").await.unwrap(),
        json!({"coins": 3, "inventory": []})
    );
    store.unload("p1").await.unwrap();
    store.close().await;

    // Reloading does not rerun the step.
    let store = open_store(&services, migrated()).await;
    store.load("p1").await.unwrap();
    assert_eq!(
        store.get("p1").await.unwrap(),
        json!({"coins": 3, "inventory": []})
    );
    store.close().await;

    // A store that no longer knows the step refuses the record.
    let store = open_store(&services, coins_config()).await;
    let err = store.load("p1").await.unwrap_err();
    assert!(matches!(err, Error::UnknownMigration { .. }));
    store.close().await;
}

#[tokio::test]
async fn sharded_record_round_trip() {
    let services = Services::new();
    let config = || {
        StoreConfig::new("players", json!({"blob": ""})).with_max_doc_bytes(4096)
    };
    let store = open_store(&services, config()).await;

    // Roughly three budgets worth of payload.
    let blob = "x".repeat(3 * 4096);
    store.load("p1").await.unwrap();
    store
        .update("p1", move |data| {
            data["blob"] = json!(blob);
            true
        })
        .await
        .unwrap();
    store.save("p1").await.unwrap();
    store.unload("p1").await.unwrap();
    store.close().await;

    // Fresh process: reassembly, hash check, identical data.
    let store = open_store(&services, config()).await;
    store.load("p1").await.unwrap();
    let data = store.get("p1").await.unwrap();
    assert_eq!(data["blob"].as_str().unwrap().len(), 3 * 4096);

    // The primary document carries only the manifest; the DocStore holds
    // exactly the manifest's shards plus the primary.
    let primary = services.docs.read("players/p1").await.unwrap().unwrap();
    let envelope = codec::decode(&primary.body).unwrap();
    let manifest = envelope.manifest.expect("sharded record");
    assert!(envelope.data.is_none());
    assert!(manifest.shard_ids.len() >= 3);

    let mut expected: Vec<String> = manifest.shard_ids.clone();
    expected.push("players/p1".to_string());
    expected.sort();
    assert_eq!(services.docs.list("players/p1").await.unwrap(), expected);
    store.close().await;
}

#[tokio::test]
async fn shrinking_write_cleans_up_orphans() {
    let services = Services::new();
    let config = || {
        StoreConfig::new("players", json!({"blob": ""})).with_max_doc_bytes(4096)
    };
    let store = open_store(&services, config()).await;

    let blob = "x".repeat(4 * 4096);
    store.load("p1").await.unwrap();
    store
        .update("p1", move |data| {
            data["blob"] = json!(blob);
            true
        })
        .await
        .unwrap();
    store.save("p1").await.unwrap();

    store
        .update("p1", |data| {
            data["blob"] = json!("");
            true
        })
        .await
        .unwrap();
    store.save("p1").await.unwrap();

    // Every shard sibling was orphaned and deleted; the queue document
    // is drained.
    let ids = services.docs.list("players/").await.unwrap();
    assert!(!ids.iter().any(|id| id.contains("/shard/")));
    let queue = services.docs.read("players/orphans").await.unwrap().unwrap();
    let queued: Vec<String> = serde_json::from_slice(&queue.body).unwrap();
    assert!(queued.is_empty());

    store.close().await;
}

#[tokio::test]
async fn observers_see_loads_and_updates() {
    use std::sync::Mutex;

    let services = Services::new();
    let seen: Arc<Mutex<Vec<(Option<Value>, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let config = coins_config().with_observer(Arc::new(move |event: &coffer::ChangeEvent| {
        sink.lock().unwrap().push((
            event.old.as_deref().cloned(),
            (*event.new).clone(),
        ));
    }));
    let store = open_store(&services, config).await;

    store.load("p1").await.unwrap();
    store
        .update("p1", |data| {
            data["coins"] = json!(2);
            true
        })
        .await
        .unwrap();
    store.close().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (None, json!({"coins": 0})));
    assert_eq!(
        seen[1],
        (Some(json!({"coins": 0})), json!({"coins": 2}))
    );
}

#[tokio::test]
async fn corrupt_primary_fails_the_load() {
    let services = Services::new();
    services
        .docs
        .write(
            "players/p1",
            backend::Expect::Any,
            bytes::Bytes::from_static(b"{ not json"),
        )
        .await
        .unwrap();

    let store = open_store(&services, coins_config()).await;
    let err = store.load("p1").await.unwrap_err();
    assert!(matches!(err, Error::CorruptRecord { .. }));
    assert!(matches!(
        store.peek("p1").await.unwrap_err(),
        Error::CorruptRecord { .. }
    ));
    store.close().await;
}
