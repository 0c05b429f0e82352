//! Generic database backend for the cache store.
//!
//! Works with any sqlx-compatible database (currently Postgres and SQLite)
//! by abstracting over parameter binding syntax and query-result metadata.
//! Schema creation is database-specific and lives in the per-backend
//! wrapper modules; everything here is plain DML.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use sqlx::{
    query, query_as, query_scalar, ColumnIndex, Database, Decode, Encode, Executor, FromRow,
    IntoArguments, Pool, Postgres, Sqlite, Type,
};

use crate::extract::TableRef;
use crate::store::{CacheEntry, CacheKey, HistoryRecord, SchemaSnapshot, StoreError};

/// Retries for version assignment races on schema snapshots.
const MAX_VERSION_RETRIES: usize = 3;

/// Extension trait for sqlx databases used by the cache store.
///
/// Handles the differences the generic code cannot paper over: parameter
/// placeholder syntax (`$1` vs `?`) and extracting the affected-row count
/// from the database-specific query result.
pub trait StoreDatabase: Database {
    /// Returns the parameter placeholder for the given 1-based index.
    fn bind_param(index: usize) -> Cow<'static, str>;

    /// Rows affected by an executed statement.
    fn rows_affected(result: &Self::QueryResult) -> u64;
}

impl StoreDatabase for Postgres {
    fn bind_param(index: usize) -> Cow<'static, str> {
        Cow::Owned(format!("${}", index))
    }

    fn rows_affected(result: &Self::QueryResult) -> u64 {
        result.rows_affected()
    }
}

impl StoreDatabase for Sqlite {
    fn bind_param(_: usize) -> Cow<'static, str> {
        Cow::Borrowed("?")
    }

    fn rows_affected(result: &Self::QueryResult) -> u64 {
        result.rows_affected()
    }
}

const ENTRY_COLUMNS: &str = "fingerprint, owner_identity, query_text, payload_json, \
     metadata_json, created_at, expires_at, hit_count";

#[derive(FromRow)]
struct EntryRow {
    fingerprint: String,
    owner_identity: String,
    query_text: String,
    payload_json: String,
    metadata_json: String,
    created_at: i64,
    expires_at: i64,
    hit_count: i64,
}

impl From<EntryRow> for CacheEntry {
    fn from(row: EntryRow) -> Self {
        CacheEntry {
            key: CacheKey::from_columns(row.fingerprint, row.owner_identity),
            query_text: row.query_text,
            payload_json: row.payload_json,
            metadata_json: row.metadata_json,
            created_at: from_millis(row.created_at),
            expires_at: from_millis(row.expires_at),
            hit_count: row.hit_count,
        }
    }
}

#[derive(FromRow)]
struct KeyRow {
    fingerprint: String,
    owner_identity: String,
}

#[derive(FromRow)]
struct HistoryRow {
    owner_identity: String,
    query_text: String,
    tables_json: String,
    duration_ms: Option<i64>,
    bytes_processed: Option<i64>,
    success: i32,
    error_message: Option<String>,
    created_at: i64,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        HistoryRecord {
            owner_identity: if row.owner_identity.is_empty() {
                None
            } else {
                Some(row.owner_identity)
            },
            query_text: row.query_text,
            // A corrupt tables column degrades to "no tables", never an error.
            tables: serde_json::from_str(&row.tables_json).unwrap_or_default(),
            duration_ms: row.duration_ms,
            bytes_processed: row.bytes_processed,
            success: row.success != 0,
            error_message: row.error_message,
            created_at: from_millis(row.created_at),
        }
    }
}

#[derive(FromRow)]
struct DepRow {
    table_ref: String,
}

/// Generic DML backend over the cache store tables.
pub struct StoreBackend<DB: StoreDatabase> {
    pool: Pool<DB>,
}

impl<DB: StoreDatabase> StoreBackend<DB> {
    pub fn new(pool: Pool<DB>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<DB> {
        &self.pool
    }
}

impl<DB> StoreBackend<DB>
where
    DB: StoreDatabase,
    EntryRow: for<'r> FromRow<'r, DB::Row>,
    KeyRow: for<'r> FromRow<'r, DB::Row>,
    HistoryRow: for<'r> FromRow<'r, DB::Row>,
    DepRow: for<'r> FromRow<'r, DB::Row>,
    for<'q> &'q str: Encode<'q, DB> + Type<DB>,
    for<'q> String: Encode<'q, DB> + Type<DB>,
    for<'q> Option<String>: Encode<'q, DB> + Type<DB>,
    for<'q> i32: Encode<'q, DB> + Type<DB>,
    for<'r> i32: Decode<'r, DB> + Type<DB>,
    for<'q> i64: Encode<'q, DB> + Type<DB>,
    for<'r> i64: Decode<'r, DB> + Type<DB>,
    for<'q> Option<i64>: Encode<'q, DB> + Type<DB>,
    for<'q> <DB as Database>::Arguments<'q>: IntoArguments<'q, DB> + Send,
    for<'c> &'c Pool<DB>: Executor<'c, Database = DB>,
    for<'c> &'c mut <DB as Database>::Connection: Executor<'c, Database = DB>,
    usize: ColumnIndex<DB::Row>,
{
    pub async fn get_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let sql = format!(
            "SELECT {} FROM cache_entries WHERE fingerprint = {} AND owner_identity = {}",
            ENTRY_COLUMNS,
            DB::bind_param(1),
            DB::bind_param(2)
        );

        let row = query_as::<DB, EntryRow>(&sql)
            .bind(key.fingerprint.as_str())
            .bind(key.owner_column())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn upsert_entry(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO cache_entries ({columns}) VALUES ({p1}, {p2}, {p3}, {p4}, {p5}, {p6}, {p7}, {p8}) \
             ON CONFLICT (fingerprint, owner_identity) DO UPDATE SET \
                 query_text = excluded.query_text, \
                 payload_json = excluded.payload_json, \
                 metadata_json = excluded.metadata_json, \
                 created_at = excluded.created_at, \
                 expires_at = excluded.expires_at, \
                 hit_count = excluded.hit_count",
            columns = ENTRY_COLUMNS,
            p1 = DB::bind_param(1),
            p2 = DB::bind_param(2),
            p3 = DB::bind_param(3),
            p4 = DB::bind_param(4),
            p5 = DB::bind_param(5),
            p6 = DB::bind_param(6),
            p7 = DB::bind_param(7),
            p8 = DB::bind_param(8),
        );

        query(&sql)
            .bind(entry.key.fingerprint.as_str())
            .bind(entry.key.owner_column())
            .bind(entry.query_text.as_str())
            .bind(entry.payload_json.as_str())
            .bind(entry.metadata_json.as_str())
            .bind(to_millis(entry.created_at))
            .bind(to_millis(entry.expires_at))
            .bind(entry.hit_count)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_entry(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM cache_entries WHERE fingerprint = {} AND owner_identity = {}",
            DB::bind_param(1),
            DB::bind_param(2)
        );

        let result = query(&sql)
            .bind(key.fingerprint.as_str())
            .bind(key.owner_column())
            .execute(&self.pool)
            .await?;

        Ok(DB::rows_affected(&result) > 0)
    }

    pub async fn increment_hit_count(&self, key: &CacheKey) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE cache_entries SET hit_count = hit_count + 1 \
             WHERE fingerprint = {} AND owner_identity = {}",
            DB::bind_param(1),
            DB::bind_param(2)
        );

        query(&sql)
            .bind(key.fingerprint.as_str())
            .bind(key.owner_column())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CacheKey>, StoreError> {
        let sql = format!(
            "SELECT fingerprint, owner_identity FROM cache_entries \
             WHERE expires_at < {} ORDER BY expires_at ASC LIMIT {}",
            DB::bind_param(1),
            DB::bind_param(2)
        );

        let rows = query_as::<DB, KeyRow>(&sql)
            .bind(to_millis(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| CacheKey::from_columns(r.fingerprint, r.owner_identity))
            .collect())
    }

    pub async fn clear_all(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        query("DELETE FROM dependency_edges")
            .execute(&mut *tx)
            .await?;
        let result = query("DELETE FROM cache_entries").execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(DB::rows_affected(&result))
    }

    /// Replace the edge set for an entry in one transaction.
    pub async fn replace_dependencies(
        &self,
        key: &CacheKey,
        tables: &[TableRef],
    ) -> Result<(), StoreError> {
        let delete_sql = format!(
            "DELETE FROM dependency_edges WHERE fingerprint = {} AND owner_identity = {}",
            DB::bind_param(1),
            DB::bind_param(2)
        );
        let insert_sql = format!(
            "INSERT INTO dependency_edges (table_ref, fingerprint, owner_identity) \
             VALUES ({}, {}, {}) ON CONFLICT DO NOTHING",
            DB::bind_param(1),
            DB::bind_param(2),
            DB::bind_param(3)
        );

        let mut tx = self.pool.begin().await?;
        query(&delete_sql)
            .bind(key.fingerprint.as_str())
            .bind(key.owner_column())
            .execute(&mut *tx)
            .await?;
        for table in tables {
            query(&insert_sql)
                .bind(table.as_str())
                .bind(key.fingerprint.as_str())
                .bind(key.owner_column())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    pub async fn drop_dependencies(&self, key: &CacheKey) -> Result<(), StoreError> {
        let sql = format!(
            "DELETE FROM dependency_edges WHERE fingerprint = {} AND owner_identity = {}",
            DB::bind_param(1),
            DB::bind_param(2)
        );

        query(&sql)
            .bind(key.fingerprint.as_str())
            .bind(key.owner_column())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete every entry depending on `table` plus all of their edges,
    /// returning the removed keys.
    pub async fn invalidate_by_table(
        &self,
        table: &TableRef,
    ) -> Result<Vec<CacheKey>, StoreError> {
        let select_sql = format!(
            "SELECT fingerprint, owner_identity FROM dependency_edges WHERE table_ref = {}",
            DB::bind_param(1)
        );
        let delete_entry_sql = format!(
            "DELETE FROM cache_entries WHERE fingerprint = {} AND owner_identity = {}",
            DB::bind_param(1),
            DB::bind_param(2)
        );
        let delete_edges_sql = format!(
            "DELETE FROM dependency_edges WHERE fingerprint = {} AND owner_identity = {}",
            DB::bind_param(1),
            DB::bind_param(2)
        );

        let mut tx = self.pool.begin().await?;
        let rows = query_as::<DB, KeyRow>(&select_sql)
            .bind(table.as_str())
            .fetch_all(&mut *tx)
            .await?;

        let keys: Vec<CacheKey> = rows
            .into_iter()
            .map(|r| CacheKey::from_columns(r.fingerprint, r.owner_identity))
            .collect();

        for key in &keys {
            query(&delete_entry_sql)
                .bind(key.fingerprint.as_str())
                .bind(key.owner_column())
                .execute(&mut *tx)
                .await?;
            query(&delete_edges_sql)
                .bind(key.fingerprint.as_str())
                .bind(key.owner_column())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(keys)
    }

    pub async fn list_dependencies(&self, key: &CacheKey) -> Result<Vec<TableRef>, StoreError> {
        let sql = format!(
            "SELECT table_ref FROM dependency_edges \
             WHERE fingerprint = {} AND owner_identity = {} ORDER BY table_ref",
            DB::bind_param(1),
            DB::bind_param(2)
        );

        let rows = query_as::<DB, DepRow>(&sql)
            .bind(key.fingerprint.as_str())
            .bind(key.owner_column())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| TableRef::parse(&r.table_ref))
            .collect())
    }

    pub async fn entry_count(&self) -> Result<i64, StoreError> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn storage_bytes_estimate(&self) -> Result<i64, StoreError> {
        let bytes: i64 =
            query_scalar("SELECT COALESCE(SUM(LENGTH(payload_json)), 0) FROM cache_entries")
                .fetch_one(&self.pool)
                .await?;
        Ok(bytes)
    }

    pub async fn oldest_entry_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let millis: Option<i64> = query_scalar("SELECT MIN(created_at) FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(millis.map(from_millis))
    }

    pub async fn untracked_entry_count(&self) -> Result<i64, StoreError> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM cache_entries e WHERE NOT EXISTS \
             (SELECT 1 FROM dependency_edges d \
              WHERE d.fingerprint = e.fingerprint AND d.owner_identity = e.owner_identity)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn insert_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let tables_json = serde_json::to_string(&record.tables)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let sql = format!(
            "INSERT INTO query_history (owner_identity, query_text, tables_json, duration_ms, \
             bytes_processed, success, error_message, created_at) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {})",
            DB::bind_param(1),
            DB::bind_param(2),
            DB::bind_param(3),
            DB::bind_param(4),
            DB::bind_param(5),
            DB::bind_param(6),
            DB::bind_param(7),
            DB::bind_param(8),
        );

        query(&sql)
            .bind(record.owner_identity.as_deref().unwrap_or(""))
            .bind(record.query_text.as_str())
            .bind(tables_json.as_str())
            .bind(record.duration_ms)
            .bind(record.bytes_processed)
            .bind(if record.success { 1i32 } else { 0i32 })
            .bind(record.error_message.clone())
            .bind(to_millis(record.created_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn list_history(
        &self,
        owner_identity: Option<&str>,
        limit: u32,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let columns = "owner_identity, query_text, tables_json, duration_ms, bytes_processed, \
             success, error_message, created_at";

        let rows = match owner_identity {
            Some(owner) => {
                let sql = format!(
                    "SELECT {} FROM query_history WHERE owner_identity = {} \
                     ORDER BY created_at DESC, id DESC LIMIT {}",
                    columns,
                    DB::bind_param(1),
                    DB::bind_param(2)
                );
                query_as::<DB, HistoryRow>(&sql)
                    .bind(owner)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM query_history ORDER BY created_at DESC, id DESC LIMIT {}",
                    columns,
                    DB::bind_param(1)
                );
                query_as::<DB, HistoryRow>(&sql)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Insert a snapshot with the next version for its table. Retries handle
    /// the rare concurrent-writer race on the (table_ref, version) key.
    pub async fn insert_schema_snapshot(
        &self,
        snapshot: &SchemaSnapshot,
    ) -> Result<i32, StoreError> {
        let insert_sql = format!(
            "INSERT INTO schema_snapshots (table_ref, schema_version, schema_json, row_count, \
             size_bytes, created_at) VALUES ({}, {}, {}, {}, {}, {})",
            DB::bind_param(1),
            DB::bind_param(2),
            DB::bind_param(3),
            DB::bind_param(4),
            DB::bind_param(5),
            DB::bind_param(6),
        );

        for _ in 0..MAX_VERSION_RETRIES {
            let next = self.latest_schema_version(&snapshot.table).await?.unwrap_or(0) + 1;

            let result = query(&insert_sql)
                .bind(snapshot.table.as_str())
                .bind(next)
                .bind(snapshot.schema_json.as_str())
                .bind(snapshot.row_count)
                .bind(snapshot.size_bytes)
                .bind(to_millis(Utc::now()))
                .execute(&self.pool)
                .await;

            match result {
                Ok(_) => return Ok(next),
                Err(sqlx::Error::Database(db_err)) => {
                    let is_unique_violation = matches!(
                        db_err.code().map(|c| c.to_string()).as_deref(),
                        // Postgres unique_violation; SQLite CONSTRAINT_UNIQUE /
                        // CONSTRAINT_PRIMARYKEY
                        Some("23505") | Some("2067") | Some("1555")
                    );
                    if is_unique_violation {
                        continue;
                    }
                    return Err(sqlx::Error::Database(db_err).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Unavailable(format!(
            "failed to assign schema version for {} after {} attempts",
            snapshot.table, MAX_VERSION_RETRIES
        )))
    }

    pub async fn latest_schema_version(
        &self,
        table: &TableRef,
    ) -> Result<Option<i32>, StoreError> {
        let sql = format!(
            "SELECT MAX(schema_version) FROM schema_snapshots WHERE table_ref = {}",
            DB::bind_param(1)
        );

        let version: Option<i32> = query_scalar(&sql)
            .bind(table.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}
