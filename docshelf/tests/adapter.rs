use std::{sync::Arc, time::Duration};

use bson::{Bson, DateTime, Document, doc};
use docshelf::{
    memory::{InMemoryStore, InMemoryStoreBuilder},
    prelude::*,
};

type MemoryAdapter = StorageAdapter<InMemoryStoreBuilder>;

fn config() -> StorageConfig {
    StorageConfig {
        connect_timeout: Duration::from_secs(1),
        health_interval: Duration::from_millis(20),
        probe_timeout: Duration::from_millis(100),
        ..StorageConfig::default()
    }
}

fn adapter() -> (MemoryAdapter, InMemoryStore, ManualClock) {
    let builder = InMemoryStore::builder();
    let store = builder.store().clone();
    let clock = ManualClock::new(DateTime::from_millis(1_700_000_000_000));
    let adapter = StorageAdapter::new(builder, config()).with_clock(Arc::new(clock.clone()));

    (adapter, store, clock)
}

async fn started() -> (MemoryAdapter, InMemoryStore, ManualClock) {
    let (adapter, store, clock) = adapter();
    adapter.start().await.unwrap();
    wait_for_availability(&adapter, true).await;

    (adapter, store, clock)
}

async fn wait_for_availability(adapter: &MemoryAdapter, expected: bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while adapter.is_available() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("adapter availability never became {expected}"));
}

async fn by_id(adapter: &MemoryAdapter, collection: &str, id: &str) -> Document {
    adapter
        .get_one(collection, &Filter::new(Predicate::eq("_id", id)), None)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{id} not found in {collection}"))
}

fn ids(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .map(|d| d.get_str("_id").unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn insert_then_update_keeps_identity_and_creation_time() {
    let (adapter, _, clock) = started().await;

    let created = adapter
        .up_sert("items", None, &Filter::all(), doc! { "name": "test" })
        .await
        .unwrap();
    assert!(created.is_insert());
    assert!(created.acknowledged);
    let id = created.id.clone().unwrap();

    let first = by_id(&adapter, "items", &id).await;
    assert_eq!(first.get_str("_item_id").unwrap(), "items");
    assert_eq!(first.get_datetime("_cat").unwrap(), first.get_datetime("_mat").unwrap());

    clock.advance_millis(250);
    let updated = adapter
        .up_sert("items", Some(id.as_str()), &Filter::all(), doc! { "name": "test2" })
        .await
        .unwrap();
    assert!(updated.is_update());
    assert_eq!(updated.id.as_deref(), Some(id.as_str()));

    let second = by_id(&adapter, "items", &id).await;
    assert_eq!(second.get_str("name").unwrap(), "test2");
    assert_eq!(second.get_datetime("_cat").unwrap(), first.get_datetime("_cat").unwrap());
    assert!(second.get_datetime("_mat").unwrap() > first.get_datetime("_mat").unwrap());
    assert_eq!(adapter.count("items", &Filter::all()).await.unwrap(), 1);
}

#[tokio::test]
async fn modified_time_moves_forward_when_the_clock_does_not() {
    let (adapter, _, _) = started().await;

    adapter.up_sert("items", Some("k"), &Filter::all(), doc! { "v": 1 }).await.unwrap();
    let before = *by_id(&adapter, "items", "k").await.get_datetime("_mat").unwrap();

    adapter.up_sert("items", Some("k"), &Filter::all(), doc! { "v": 2 }).await.unwrap();
    let after = *by_id(&adapter, "items", "k").await.get_datetime("_mat").unwrap();

    assert_eq!(after.timestamp_millis(), before.timestamp_millis() + 1);
}

#[tokio::test]
async fn updates_merge_only_supplied_fields() {
    let (adapter, _, _) = started().await;

    adapter.up_sert("items", Some("k"), &Filter::all(), doc! { "a": 1, "b": 2 }).await.unwrap();
    adapter.up_sert("items", Some("k"), &Filter::all(), doc! { "b": 3 }).await.unwrap();

    let stored = by_id(&adapter, "items", "k").await;
    assert_eq!(stored.get_i32("a").unwrap(), 1);
    assert_eq!(stored.get_i32("b").unwrap(), 3);
}

#[tokio::test]
async fn payload_cannot_overwrite_id_or_creation_time() {
    let (adapter, _, clock) = started().await;

    adapter.up_sert("items", Some("k"), &Filter::all(), doc! { "v": 1 }).await.unwrap();
    let created_at = *by_id(&adapter, "items", "k").await.get_datetime("_cat").unwrap();

    clock.advance_millis(10);
    adapter
        .up_sert(
            "items",
            Some("k"),
            &Filter::all(),
            doc! { "_id": "hijack", "_cat": DateTime::from_millis(0), "v": 2 },
        )
        .await
        .unwrap();

    let stored = by_id(&adapter, "items", "k").await;
    assert_eq!(stored.get_i32("v").unwrap(), 2);
    assert_eq!(*stored.get_datetime("_cat").unwrap(), created_at);
    assert_eq!(adapter.count("items", &Filter::new(Predicate::eq("_id", "hijack"))).await.unwrap(), 0);
}

#[tokio::test]
async fn insert_ids_come_from_argument_then_payload_then_generator() {
    let (adapter, _, _) = started().await;

    let explicit = adapter.up_sert("items", Some("fixed"), &Filter::all(), doc! {}).await.unwrap();
    assert_eq!(explicit.id.as_deref(), Some("fixed"));

    let from_payload = adapter
        .up_sert("items", None, &Filter::all(), doc! { "_id": "payload" })
        .await
        .unwrap();
    assert_eq!(from_payload.id.as_deref(), Some("payload"));

    let generated = adapter.up_sert("items", None, &Filter::all(), doc! {}).await.unwrap();
    assert_eq!(generated.id.unwrap().len(), 36);
}

#[tokio::test]
async fn predicate_upsert_updates_the_matching_document() {
    let (adapter, _, _) = started().await;
    let filter = Filter::from_document(&doc! { "name": "x" });

    let first = adapter.up_sert("items", None, &filter, doc! { "name": "x", "n": 1 }).await.unwrap();
    let second = adapter.up_sert("items", None, &filter, doc! { "n": 2 }).await.unwrap();

    assert!(first.is_insert());
    assert!(second.is_update());
    assert_eq!(first.id, second.id);
    assert_eq!(adapter.count("items", &Filter::all()).await.unwrap(), 1);
}

#[tokio::test]
async fn pages_are_slices_of_the_full_ordering() {
    let (adapter, _, clock) = started().await;

    for i in 0..25 {
        // Groups of three share a creation time so the tie-breaker matters.
        if i % 3 == 0 {
            clock.advance_millis(1);
        }
        let id = format!("{:02}", (i * 7) % 25);
        adapter.up_sert("pages", Some(id.as_str()), &Filter::all(), doc! { "i": i }).await.unwrap();
    }

    let everything = adapter
        .get_many("pages", &Filter::all(), &Query::from_parts(Some(0), Some(100), None).unwrap())
        .await
        .unwrap();
    assert_eq!(everything.len(), 25);

    for pair in everything.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        let (cat_a, cat_b) = (a.get_datetime("_cat").unwrap(), b.get_datetime("_cat").unwrap());
        assert!(cat_a > cat_b || (cat_a == cat_b && a.get_str("_id").unwrap() < b.get_str("_id").unwrap()));
    }

    let full = ids(&everything);
    for offset in [0, 5, 20, 24, 30] {
        for limit in [1, 7, 50] {
            let query = Query::from_parts(Some(offset), Some(limit), Some(r#"{"_cat": -1}"#)).unwrap();
            let page = adapter.get_many("pages", &Filter::all(), &query).await.unwrap();

            let expected = full
                .iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect::<Vec<_>>();
            assert_eq!(ids(&page), expected, "offset {offset} limit {limit}");
        }
    }
}

#[tokio::test]
async fn get_one_follows_the_requested_sort() {
    let (adapter, _, _) = started().await;

    for (id, rank) in [("a", 2), ("b", 9), ("c", 5)] {
        adapter.up_sert("ranked", Some(id), &Filter::all(), doc! { "rank": rank }).await.unwrap();
    }

    let top = Query::builder().sort("rank", SortDirection::Desc).build();
    let bottom = Query::builder().sort("rank", SortDirection::Asc).build();

    let first = adapter.get_one("ranked", &Filter::all(), Some(&top)).await.unwrap().unwrap();
    let last = adapter.get_one("ranked", &Filter::all(), Some(&bottom)).await.unwrap().unwrap();

    assert_eq!(first.get_str("_id").unwrap(), "b");
    assert_eq!(last.get_str("_id").unwrap(), "a");
    assert!(adapter.get_one("nothing", &Filter::all(), None).await.unwrap().is_none());
}

async fn seed_tenants(adapter: &MemoryAdapter) {
    adapter.up_sert("notes", Some("a1"), &Filter::tenant(["A"], None), doc! { "kind": "note" }).await.unwrap();
    adapter.up_sert("notes", Some("b1"), &Filter::tenant(["B"], None), doc! { "kind": "note" }).await.unwrap();
    adapter
        .up_sert("notes", Some("ab"), &Filter::all(), doc! { "kind": "note", "_tenant": ["A", "B"] })
        .await
        .unwrap();
    adapter.up_sert("notes", Some("none"), &Filter::all(), doc! { "kind": "note" }).await.unwrap();
}

#[tokio::test]
async fn tenant_scope_hides_other_tenants() {
    let (adapter, _, _) = started().await;
    seed_tenants(&adapter).await;

    let scope = Filter::tenant(["A"], Some(Predicate::eq("kind", "note")));

    let mut many = ids(&adapter.get_many("notes", &scope, &Query::default()).await.unwrap());
    many.sort();
    assert_eq!(many, vec!["a1", "ab"]);

    let one = adapter
        .get_one("notes", &Filter::tenant(["A"], Some(Predicate::eq("_id", "b1"))), None)
        .await
        .unwrap();
    assert!(one.is_none());

    let mut aggregated = ids(&adapter.aggregate("notes", &scope, vec![]).await.unwrap());
    aggregated.sort();
    assert_eq!(aggregated, vec!["a1", "ab"]);

    assert_eq!(adapter.count("notes", &Filter::tenant(["B"], None)).await.unwrap(), 2);
}

#[tokio::test]
async fn tenant_writes_stay_inside_the_tenant() {
    let (adapter, _, _) = started().await;
    seed_tenants(&adapter).await;

    let outcome = adapter.delete("notes", "b1", Some(&Filter::tenant(["A"], None))).await.unwrap();
    assert_eq!(outcome.kind, WriteKind::Noop);
    assert_eq!(by_id(&adapter, "notes", "b1").await.get_str("_tenant").unwrap(), "B");

    let outcome = adapter
        .up_sert("notes", Some("b1"), &Filter::tenant(["A"], None), doc! { "kind": "stolen" })
        .await;
    // b1 is not visible to A, so the upsert tries a fresh insert with the same _id.
    assert!(matches!(outcome, Err(StorageError::DuplicateKey(..))));
    assert_eq!(by_id(&adapter, "notes", "b1").await.get_str("kind").unwrap(), "note");
}

#[tokio::test]
async fn multi_tenant_upserts_stay_visible_to_every_tenant_in_scope() {
    let (adapter, _, _) = started().await;
    let scope = Filter::tenant(["A", "B"], Some(Predicate::eq("name", "x")));

    let first = adapter.up_sert("shared", None, &scope, doc! { "name": "x", "v": 1 }).await.unwrap();
    let second = adapter.up_sert("shared", None, &scope, doc! { "name": "x", "v": 2 }).await.unwrap();

    assert_eq!(first.kind, WriteKind::Inserted);
    assert_eq!(second.kind, WriteKind::Updated);
    assert_eq!(second.id, first.id);
    assert_eq!(adapter.count("shared", &Filter::all()).await.unwrap(), 1);

    let stored = adapter.get_one("shared", &scope, None).await.unwrap().unwrap();
    assert_eq!(stored.get_i32("v").unwrap(), 2);
    assert_eq!(stored.get_array("_tenant").unwrap(), &vec![Bson::from("A"), Bson::from("B")]);

    for tenant in ["A", "B"] {
        assert_eq!(adapter.count("shared", &Filter::tenant([tenant], None)).await.unwrap(), 1);
    }
    assert_eq!(adapter.count("shared", &Filter::tenant(["C"], None)).await.unwrap(), 0);

    adapter
        .up_sert_many("batched", &Filter::tenant(["A", "B"], None), vec![doc! { "n": 1 }, doc! { "n": 2 }])
        .await
        .unwrap();
    assert_eq!(adapter.count("batched", &Filter::tenant(["B"], None)).await.unwrap(), 2);
}

// An empty tenant set applies no tenant restriction at all. This is intentional.
#[tokio::test]
async fn empty_tenant_set_is_unrestricted() {
    let (adapter, _, _) = started().await;
    seed_tenants(&adapter).await;

    let unrestricted = Filter::tenant(Vec::<String>::new(), None);
    assert!(!unrestricted.is_tenant_restricted());

    let all = adapter.get_many("notes", &unrestricted, &Query::default()).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(
        adapter.count("notes", &unrestricted).await.unwrap(),
        adapter.count("notes", &Filter::all()).await.unwrap(),
    );
    assert_eq!(adapter.aggregate("notes", &unrestricted, vec![]).await.unwrap().len(), 4);
}

#[tokio::test]
async fn deleting_twice_is_a_noop() {
    let (adapter, _, _) = started().await;
    adapter.up_sert("items", Some("gone"), &Filter::all(), doc! {}).await.unwrap();

    let first = adapter.delete("items", "gone", None).await.unwrap();
    assert_eq!(first.kind, WriteKind::Deleted);
    assert_eq!(first.affected, 1);

    let second = adapter.delete("items", "gone", None).await.unwrap();
    assert_eq!(second.kind, WriteKind::Noop);
    assert_eq!(second.affected, 0);
}

#[tokio::test]
async fn delete_many_reports_the_count() {
    let (adapter, _, _) = started().await;
    for (id, colour) in [("1", "red"), ("2", "red"), ("3", "blue")] {
        adapter.up_sert("paint", Some(id), &Filter::all(), doc! { "colour": colour }).await.unwrap();
    }

    let outcome = adapter
        .delete_many("paint", &Filter::from_document(&doc! { "colour": "red" }))
        .await
        .unwrap();

    assert_eq!(outcome.affected, 2);
    assert_eq!(ids(&adapter.get_many("paint", &Filter::all(), &Query::default()).await.unwrap()), vec!["3"]);
}

#[tokio::test]
async fn batch_upsert_inserts_each_entry_when_nothing_matches() {
    let (adapter, _, _) = started().await;

    let outcome = adapter
        .up_sert_many("batch", &Filter::all(), vec![doc! { "n": 1 }, doc! { "n": 2 }, doc! { "n": 3 }])
        .await
        .unwrap();

    assert_eq!(outcome.kind, WriteKind::Inserted);
    assert_eq!(outcome.affected, 3);

    let stored = adapter.get_many("batch", &Filter::all(), &Query::default()).await.unwrap();
    assert_eq!(stored.len(), 3);
    for document in &stored {
        assert_eq!(document.get_datetime("_cat").unwrap(), document.get_datetime("_mat").unwrap());
    }
}

#[tokio::test]
async fn batch_upsert_merges_into_every_match() {
    let (adapter, _, clock) = started().await;
    adapter.up_sert("batch", Some("x"), &Filter::all(), doc! { "keep": 1 }).await.unwrap();
    adapter.up_sert("batch", Some("y"), &Filter::all(), doc! { "keep": 2 }).await.unwrap();

    clock.advance_millis(5);
    let outcome = adapter
        .up_sert_many("batch", &Filter::all(), vec![doc! { "a": 1, "b": 1 }, doc! { "b": 2, "_id": "z" }])
        .await
        .unwrap();

    assert_eq!(outcome.kind, WriteKind::Updated);
    assert_eq!(outcome.affected, 2);

    for (id, keep) in [("x", 1), ("y", 2)] {
        let stored = by_id(&adapter, "batch", id).await;
        assert_eq!(stored.get_i32("keep").unwrap(), keep);
        assert_eq!(stored.get_i32("a").unwrap(), 1);
        assert_eq!(stored.get_i32("b").unwrap(), 2);
        assert!(stored.get_datetime("_mat").unwrap() > stored.get_datetime("_cat").unwrap());
    }
    assert_eq!(adapter.count("batch", &Filter::all()).await.unwrap(), 2);
}

#[tokio::test]
async fn batch_upsert_moves_modified_time_forward_when_the_clock_does_not() {
    let (adapter, _, _) = started().await;
    adapter.up_sert("batch", Some("x"), &Filter::all(), doc! { "n": 1 }).await.unwrap();
    let before = *by_id(&adapter, "batch", "x").await.get_datetime("_mat").unwrap();

    adapter.up_sert_many("batch", &Filter::all(), vec![doc! { "n": 2 }]).await.unwrap();
    let after = by_id(&adapter, "batch", "x").await;

    assert_eq!(after.get_i32("n").unwrap(), 2);
    assert!(*after.get_datetime("_mat").unwrap() > before);
    assert_eq!(*after.get_datetime("_cat").unwrap(), before);
}

#[tokio::test]
async fn batch_upsert_reports_partial_progress() {
    let (adapter, _, _) = started().await;

    let err = adapter
        .up_sert_many("batch", &Filter::all(), vec![doc! { "_id": "d" }, doc! { "_id": "d" }, doc! { "n": 3 }])
        .await
        .unwrap_err();

    match err {
        StorageError::PartialWrite { affected, source } => {
            assert_eq!(affected, 1);
            assert!(matches!(*source, StorageError::DuplicateKey(..)));
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(adapter.count("batch", &Filter::all()).await.unwrap(), 1);
}

#[tokio::test]
async fn aggregate_runs_pipeline_after_scope() {
    let (adapter, _, _) = started().await;
    seed_tenants(&adapter).await;

    let counted = adapter
        .aggregate("notes", &Filter::tenant(["B"], None), vec![doc! { "$count": "total" }])
        .await
        .unwrap();

    assert_eq!(counted, vec![doc! { "total": 2_i64 }]);
}

#[tokio::test]
async fn invalid_queries_are_rejected() {
    let (adapter, _, _) = started().await;

    let zero_limit = Query::builder().limit(0).build();
    let err = adapter.get_many("items", &Filter::all(), &zero_limit).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidQuery(_)));

    assert!(matches!(Query::from_parts(None, None, Some("{oops")), Err(StorageError::InvalidQuery(_))));
}

#[tokio::test]
async fn operations_need_a_started_adapter() {
    let (adapter, store, _) = adapter();

    assert_eq!(adapter.state(), ConnectionState::Disconnected);
    let err = adapter.get_many("items", &Filter::all(), &Query::default()).await.unwrap_err();
    assert!(matches!(err, StorageError::NotConnected));

    adapter.start().await.unwrap();
    wait_for_availability(&adapter, true).await;
    assert_eq!(adapter.state(), ConnectionState::Available);
    adapter.up_sert("items", Some("k"), &Filter::all(), doc! {}).await.unwrap();

    adapter.stop().await;
    adapter.stop().await;

    assert_eq!(adapter.state(), ConnectionState::Disconnected);
    assert!(!adapter.is_available());
    assert!(adapter.health().await.is_none());
    assert_eq!(store.close_count(), 1);

    let err = adapter.up_sert("items", Some("k"), &Filter::all(), doc! {}).await.unwrap_err();
    assert!(matches!(err, StorageError::NotConnected));
}

#[tokio::test]
async fn unreachable_backend_at_start_is_not_an_error() {
    let (adapter, store, _) = adapter();
    store.set_reachable(false);

    adapter.start().await.unwrap();

    assert_eq!(adapter.state(), ConnectionState::Unavailable);
    assert!(!adapter.is_available());
    assert!(adapter.count("items", &Filter::all()).await.unwrap_err().is_connection_error());

    store.set_reachable(true);
    adapter.start().await.unwrap();
    wait_for_availability(&adapter, true).await;
    assert_eq!(adapter.count("items", &Filter::all()).await.unwrap(), 0);
}

#[tokio::test]
async fn health_monitor_tracks_the_backend() {
    let (adapter, store, _) = started().await;

    store.set_reachable(false);
    wait_for_availability(&adapter, false).await;
    assert_eq!(adapter.state(), ConnectionState::Unavailable);

    let err = adapter.get_many("items", &Filter::all(), &Query::default()).await.unwrap_err();
    assert!(matches!(err, StorageError::ConnectionFailure(_)));

    let health = adapter.health().await.unwrap();
    assert!(!health.available);
    assert!(health.consecutive_failures >= 1);

    store.set_reachable(true);
    wait_for_availability(&adapter, true).await;
    assert!(adapter.validate_connection().await);
}

#[tokio::test]
async fn restart_replaces_the_handle() {
    let (adapter, store, _) = started().await;
    adapter.up_sert("items", Some("k"), &Filter::all(), doc! { "v": 1 }).await.unwrap();

    adapter.start().await.unwrap();
    wait_for_availability(&adapter, true).await;

    assert_eq!(store.close_count(), 1);
    assert_eq!(by_id(&adapter, "items", "k").await.get_i32("v").unwrap(), 1);
}

#[tokio::test]
async fn invalid_configuration_is_returned_from_start() {
    let builder = InMemoryStore::builder();
    let config = StorageConfig { host: String::new(), ..config() };
    let adapter = StorageAdapter::new(builder, config);

    let err = adapter.start().await.unwrap_err();
    assert!(matches!(err, StorageError::Configuration(_)));
    assert_eq!(adapter.state(), ConnectionState::Disconnected);
}
