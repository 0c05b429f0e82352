//! Postgres-backed cache store.

use std::fmt::{self, Debug, Formatter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

use super::backend::StoreBackend;
use super::{CacheEntry, CacheKey, CacheStore, HistoryRecord, SchemaSnapshot, StoreError};
use crate::extract::TableRef;

pub struct PostgresCacheStore {
    backend: StoreBackend<Postgres>,
}

impl Debug for PostgresCacheStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCacheStore").finish()
    }
}

impl PostgresCacheStore {
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await?;

        Ok(Self {
            backend: StoreBackend::new(pool),
        })
    }

    async fn initialize_schema(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT NOT NULL,
                owner_identity TEXT NOT NULL DEFAULT '',
                query_text TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at BIGINT NOT NULL,
                expires_at BIGINT NOT NULL,
                hit_count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (fingerprint, owner_identity)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at \
             ON cache_entries (expires_at)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dependency_edges (
                table_ref TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                owner_identity TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (table_ref, fingerprint, owner_identity)
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dependency_edges_key \
             ON dependency_edges (fingerprint, owner_identity)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS query_history (
                id BIGSERIAL PRIMARY KEY,
                owner_identity TEXT NOT NULL DEFAULT '',
                query_text TEXT NOT NULL,
                tables_json TEXT NOT NULL DEFAULT '[]',
                duration_ms BIGINT,
                bytes_processed BIGINT,
                success INTEGER NOT NULL,
                error_message TEXT,
                created_at BIGINT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_snapshots (
                table_ref TEXT NOT NULL,
                schema_version INTEGER NOT NULL,
                schema_json TEXT NOT NULL,
                row_count BIGINT,
                size_bytes BIGINT,
                created_at BIGINT NOT NULL,
                PRIMARY KEY (table_ref, schema_version)
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        Self::initialize_schema(self.backend.pool()).await
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.backend.get_entry(key).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.backend.upsert_entry(entry).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.backend.delete_entry(key).await
    }

    async fn increment_hit_count(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.backend.increment_hit_count(key).await
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CacheKey>, StoreError> {
        self.backend.list_expired(now, limit).await
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        self.backend.clear_all().await
    }

    async fn record_dependencies(
        &self,
        key: &CacheKey,
        tables: &[TableRef],
    ) -> Result<(), StoreError> {
        self.backend.replace_dependencies(key, tables).await
    }

    async fn drop_dependencies(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.backend.drop_dependencies(key).await
    }

    async fn invalidate_by_table(&self, table: &TableRef) -> Result<Vec<CacheKey>, StoreError> {
        self.backend.invalidate_by_table(table).await
    }

    async fn list_dependencies(&self, key: &CacheKey) -> Result<Vec<TableRef>, StoreError> {
        self.backend.list_dependencies(key).await
    }

    async fn entry_count(&self) -> Result<i64, StoreError> {
        self.backend.entry_count().await
    }

    async fn storage_bytes_estimate(&self) -> Result<i64, StoreError> {
        self.backend.storage_bytes_estimate().await
    }

    async fn oldest_entry_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.backend.oldest_entry_created_at().await
    }

    async fn untracked_entry_count(&self) -> Result<i64, StoreError> {
        self.backend.untracked_entry_count().await
    }

    async fn record_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        self.backend.insert_history(record).await
    }

    async fn list_history(
        &self,
        owner_identity: Option<&str>,
        limit: u32,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.backend.list_history(owner_identity, limit).await
    }

    async fn record_schema_snapshot(&self, snapshot: &SchemaSnapshot) -> Result<i32, StoreError> {
        self.backend.insert_schema_snapshot(snapshot).await
    }

    async fn latest_schema_version(&self, table: &TableRef) -> Result<Option<i32>, StoreError> {
        self.backend.latest_schema_version(table).await
    }
}
