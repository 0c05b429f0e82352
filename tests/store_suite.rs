//! One behavior suite, run against every cache store backend.

use chrono::{DateTime, Duration, Utc};
use querygate::{
    CacheEntry, CacheKey, CacheStore, HistoryRecord, MemoryCacheStore, SchemaSnapshot,
    SqliteCacheStore, TableRef,
};
use tempfile::TempDir;

struct StoreTestContext<S, G = ()> {
    store: S,
    _guard: G,
}

impl<S, G> StoreTestContext<S, G> {
    fn new(store: S, guard: G) -> Self {
        Self {
            store,
            _guard: guard,
        }
    }
}

impl<S: CacheStore, G> StoreTestContext<S, G> {
    fn store(&self) -> &S {
        &self.store
    }
}

async fn create_sqlite_store() -> StoreTestContext<SqliteCacheStore, TempDir> {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("cache.sqlite");
    let store = SqliteCacheStore::new(db_path.to_str().unwrap())
        .await
        .unwrap();
    store.run_migrations().await.unwrap();
    StoreTestContext::new(store, dir)
}

async fn create_memory_store() -> StoreTestContext<MemoryCacheStore> {
    let store = MemoryCacheStore::new();
    store.run_migrations().await.unwrap();
    StoreTestContext::new(store, ())
}

fn key(fingerprint: &str, owner: Option<&str>) -> CacheKey {
    CacheKey::new(fingerprint.to_string(), owner.map(|s| s.to_string()))
}

fn entry_at(
    fingerprint: &str,
    owner: Option<&str>,
    created_at: DateTime<Utc>,
    ttl_secs: i64,
) -> CacheEntry {
    CacheEntry {
        key: key(fingerprint, owner),
        query_text: "SELECT * FROM sales.orders".to_string(),
        payload_json: r#"{"rows":[{"n":1}],"schema":[]}"#.to_string(),
        metadata_json: r#"{"bytes_processed":100}"#.to_string(),
        created_at,
        expires_at: created_at + Duration::seconds(ttl_secs),
        hit_count: 0,
    }
}

fn entry(fingerprint: &str, owner: Option<&str>, ttl_secs: i64) -> CacheEntry {
    entry_at(fingerprint, owner, Utc::now(), ttl_secs)
}

fn table(name: &str) -> TableRef {
    TableRef::parse(name).unwrap()
}

macro_rules! cache_store_tests {
    ($module:ident, $setup_fn:ident) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn put_get_roundtrip() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let e = entry("f1", Some("tenant-a"), 60);
                store.put(&e).await.unwrap();

                let fetched = store.get(&e.key).await.unwrap().unwrap();
                assert_eq!(fetched.key, e.key);
                assert_eq!(fetched.query_text, e.query_text);
                assert_eq!(fetched.payload_json, e.payload_json);
                assert_eq!(fetched.metadata_json, e.metadata_json);
                assert_eq!(fetched.hit_count, 0);
            }

            #[tokio::test]
            async fn get_missing_returns_none() {
                let ctx = super::$setup_fn().await;
                assert!(ctx.store().get(&key("absent", None)).await.unwrap().is_none());
            }

            #[tokio::test]
            async fn put_is_idempotent_and_replaces_wholesale() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let e = entry("f1", None, 60);
                store.put(&e).await.unwrap();
                store.put(&e).await.unwrap();
                assert_eq!(store.entry_count().await.unwrap(), 1);

                // A fresh entry fully supersedes the old one, hit count included.
                store.increment_hit_count(&e.key).await.unwrap();
                let mut replacement = entry("f1", None, 120);
                replacement.payload_json = r#"{"rows":[{"n":2}],"schema":[]}"#.to_string();
                store.put(&replacement).await.unwrap();

                let fetched = store.get(&e.key).await.unwrap().unwrap();
                assert_eq!(fetched.payload_json, replacement.payload_json);
                assert_eq!(fetched.hit_count, 0);
            }

            #[tokio::test]
            async fn owner_identity_partitions_entries() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let shared = entry("f1", None, 60);
                let mut tenant = entry("f1", Some("tenant-a"), 60);
                tenant.payload_json = r#"{"rows":[{"n":9}],"schema":[]}"#.to_string();

                store.put(&shared).await.unwrap();
                store.put(&tenant).await.unwrap();

                assert_eq!(store.entry_count().await.unwrap(), 2);
                let fetched = store.get(&tenant.key).await.unwrap().unwrap();
                assert_eq!(fetched.payload_json, tenant.payload_json);
                let fetched = store.get(&shared.key).await.unwrap().unwrap();
                assert_eq!(fetched.payload_json, shared.payload_json);
            }

            #[tokio::test]
            async fn delete_reports_whether_an_entry_was_removed() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let e = entry("f1", None, 60);
                store.put(&e).await.unwrap();
                assert!(store.delete(&e.key).await.unwrap());
                assert!(!store.delete(&e.key).await.unwrap());
                assert!(store.get(&e.key).await.unwrap().is_none());
            }

            #[tokio::test]
            async fn hit_count_increments() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let e = entry("f1", None, 60);
                store.put(&e).await.unwrap();
                store.increment_hit_count(&e.key).await.unwrap();
                store.increment_hit_count(&e.key).await.unwrap();

                let fetched = store.get(&e.key).await.unwrap().unwrap();
                assert_eq!(fetched.hit_count, 2);
            }

            #[tokio::test]
            async fn expired_entries_are_returned_by_get() {
                // Expiry policy lives in the manager, not the store.
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let created = Utc::now() - Duration::seconds(120);
                let e = entry_at("stale", None, created, 60);
                store.put(&e).await.unwrap();

                let fetched = store.get(&e.key).await.unwrap().unwrap();
                assert!(fetched.is_expired(Utc::now()));
            }

            #[tokio::test]
            async fn list_expired_pages_oldest_first() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let base = Utc::now() - Duration::seconds(300);
                store.put(&entry_at("e1", None, base, 10)).await.unwrap();
                store.put(&entry_at("e2", None, base, 20)).await.unwrap();
                store.put(&entry_at("e3", None, base, 30)).await.unwrap();
                store.put(&entry("live", None, 600)).await.unwrap();

                let now = Utc::now();
                let first_page = store.list_expired(now, 2).await.unwrap();
                assert_eq!(first_page.len(), 2);
                assert_eq!(first_page[0].fingerprint, "e1");
                assert_eq!(first_page[1].fingerprint, "e2");

                let all = store.list_expired(now, 10).await.unwrap();
                assert_eq!(all.len(), 3);
                assert!(all.iter().all(|k| k.fingerprint != "live"));
            }

            #[tokio::test]
            async fn record_dependencies_replaces_the_edge_set() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let e = entry("f1", None, 60);
                store.put(&e).await.unwrap();
                store
                    .record_dependencies(&e.key, &[table("sales.orders"), table("sales.customers")])
                    .await
                    .unwrap();

                let deps = store.list_dependencies(&e.key).await.unwrap();
                assert_eq!(deps.len(), 2);

                // A recomputed query's table set can shrink; old edges must go.
                store
                    .record_dependencies(&e.key, &[table("sales.orders")])
                    .await
                    .unwrap();
                let deps = store.list_dependencies(&e.key).await.unwrap();
                assert_eq!(deps, vec![table("sales.orders")]);
            }

            #[tokio::test]
            async fn invalidate_by_table_removes_entries_and_all_their_edges() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let a = entry("fa", None, 60);
                let b = entry("fb", Some("tenant-a"), 60);
                let c = entry("fc", None, 60);
                store.put(&a).await.unwrap();
                store.put(&b).await.unwrap();
                store.put(&c).await.unwrap();
                store
                    .record_dependencies(&a.key, &[table("sales.orders"), table("sales.items")])
                    .await
                    .unwrap();
                store
                    .record_dependencies(&b.key, &[table("sales.orders")])
                    .await
                    .unwrap();
                store
                    .record_dependencies(&c.key, &[table("sales.customers")])
                    .await
                    .unwrap();

                let removed = store.invalidate_by_table(&table("sales.orders")).await.unwrap();
                assert_eq!(removed.len(), 2);
                assert!(removed.contains(&a.key));
                assert!(removed.contains(&b.key));

                assert!(store.get(&a.key).await.unwrap().is_none());
                assert!(store.get(&b.key).await.unwrap().is_none());
                // Edges for removed entries are gone entirely, including the
                // ones pointing at other tables.
                assert!(store.list_dependencies(&a.key).await.unwrap().is_empty());
                assert!(store.list_dependencies(&b.key).await.unwrap().is_empty());

                // Unrelated entries are untouched.
                assert!(store.get(&c.key).await.unwrap().is_some());
                assert_eq!(
                    store.list_dependencies(&c.key).await.unwrap(),
                    vec![table("sales.customers")]
                );
            }

            #[tokio::test]
            async fn drop_dependencies_clears_edges() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let e = entry("f1", None, 60);
                store.put(&e).await.unwrap();
                store
                    .record_dependencies(&e.key, &[table("sales.orders")])
                    .await
                    .unwrap();
                store.drop_dependencies(&e.key).await.unwrap();
                assert!(store.list_dependencies(&e.key).await.unwrap().is_empty());
            }

            #[tokio::test]
            async fn clear_removes_entries_and_edges() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let e = entry("f1", None, 60);
                store.put(&e).await.unwrap();
                store
                    .record_dependencies(&e.key, &[table("sales.orders")])
                    .await
                    .unwrap();

                assert_eq!(store.clear().await.unwrap(), 1);
                assert_eq!(store.entry_count().await.unwrap(), 0);
                assert!(store.list_dependencies(&e.key).await.unwrap().is_empty());
                assert!(store
                    .invalidate_by_table(&table("sales.orders"))
                    .await
                    .unwrap()
                    .is_empty());
            }

            #[tokio::test]
            async fn untracked_entry_count_sees_entries_without_edges() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let tracked = entry("f1", None, 60);
                let untracked = entry("f2", None, 60);
                store.put(&tracked).await.unwrap();
                store.put(&untracked).await.unwrap();
                store
                    .record_dependencies(&tracked.key, &[table("sales.orders")])
                    .await
                    .unwrap();

                assert_eq!(store.untracked_entry_count().await.unwrap(), 1);
            }

            #[tokio::test]
            async fn aggregates_reflect_contents() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                assert_eq!(store.entry_count().await.unwrap(), 0);
                assert_eq!(store.storage_bytes_estimate().await.unwrap(), 0);
                assert!(store.oldest_entry_created_at().await.unwrap().is_none());

                let old = entry_at("f1", None, Utc::now() - Duration::seconds(500), 3600);
                let new = entry("f2", None, 3600);
                store.put(&old).await.unwrap();
                store.put(&new).await.unwrap();

                assert_eq!(store.entry_count().await.unwrap(), 2);
                assert_eq!(
                    store.storage_bytes_estimate().await.unwrap(),
                    (old.payload_json.len() + new.payload_json.len()) as i64
                );
                let oldest = store.oldest_entry_created_at().await.unwrap().unwrap();
                assert!((oldest - old.created_at).num_seconds().abs() <= 1);
            }

            #[tokio::test]
            async fn history_lists_newest_first_with_owner_filter() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let older = HistoryRecord {
                    owner_identity: Some("tenant-a".to_string()),
                    query_text: "SELECT 1".to_string(),
                    tables: vec![table("sales.orders")],
                    duration_ms: Some(12),
                    bytes_processed: Some(1024),
                    success: true,
                    error_message: None,
                    created_at: Utc::now() - Duration::seconds(10),
                };
                let newer = HistoryRecord {
                    owner_identity: None,
                    query_text: "SELECT 2".to_string(),
                    tables: vec![],
                    duration_ms: None,
                    bytes_processed: None,
                    success: false,
                    error_message: Some("engine down".to_string()),
                    created_at: Utc::now(),
                };
                store.record_history(&older).await.unwrap();
                store.record_history(&newer).await.unwrap();

                let all = store.list_history(None, 10).await.unwrap();
                assert_eq!(all.len(), 2);
                assert_eq!(all[0].query_text, "SELECT 2");
                assert!(!all[0].success);
                assert_eq!(all[1].tables, vec![table("sales.orders")]);

                let filtered = store.list_history(Some("tenant-a"), 10).await.unwrap();
                assert_eq!(filtered.len(), 1);
                assert_eq!(filtered[0].query_text, "SELECT 1");

                let limited = store.list_history(None, 1).await.unwrap();
                assert_eq!(limited.len(), 1);
            }

            #[tokio::test]
            async fn schema_snapshot_versions_increment_per_table() {
                let ctx = super::$setup_fn().await;
                let store = ctx.store();

                let snap = SchemaSnapshot {
                    table: table("sales.orders"),
                    schema_json: r#"[{"name":"id","type":"INT64"}]"#.to_string(),
                    row_count: Some(100),
                    size_bytes: Some(4096),
                };
                assert!(store
                    .latest_schema_version(&table("sales.orders"))
                    .await
                    .unwrap()
                    .is_none());
                assert_eq!(store.record_schema_snapshot(&snap).await.unwrap(), 1);
                assert_eq!(store.record_schema_snapshot(&snap).await.unwrap(), 2);
                assert_eq!(
                    store
                        .latest_schema_version(&table("sales.orders"))
                        .await
                        .unwrap(),
                    Some(2)
                );

                // Other tables have their own version sequence.
                let other = SchemaSnapshot {
                    table: table("sales.customers"),
                    schema_json: "[]".to_string(),
                    row_count: None,
                    size_bytes: None,
                };
                assert_eq!(store.record_schema_snapshot(&other).await.unwrap(), 1);
            }
        }
    };
}

cache_store_tests!(sqlite_store, create_sqlite_store);
cache_store_tests!(memory_store, create_memory_store);
