//! Durable cache store: entries, dependency edges, query history, and
//! schema snapshots.
//!
//! The store is deliberately policy-free: it returns expired entries as-is
//! (the manager owns the staleness check) and every mutation is an
//! idempotent upsert or set-replacement so retries after partial failure
//! are safe.

mod backend;
mod memory;
mod postgres;
mod sqlite;

pub use memory::MemoryCacheStore;
pub use postgres::PostgresCacheStore;
pub use sqlite::SqliteCacheStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extract::TableRef;

/// Store-level failure. Always recoverable from the caller's perspective:
/// the manager degrades to direct computation when the store is down.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Identifies one cache entry: fingerprint plus owning identity.
/// `owner_identity: None` means the entry is globally shared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub fingerprint: String,
    pub owner_identity: Option<String>,
}

impl CacheKey {
    pub fn new(fingerprint: impl Into<String>, owner_identity: Option<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            owner_identity,
        }
    }

    /// Column form of the owner: the store persists `None` as an empty
    /// string so the (fingerprint, owner) uniqueness constraint behaves the
    /// same on SQLite and Postgres (NULLs never collide in UNIQUE).
    pub(crate) fn owner_column(&self) -> &str {
        self.owner_identity.as_deref().unwrap_or("")
    }

    pub(crate) fn from_columns(fingerprint: String, owner_identity: String) -> Self {
        Self {
            fingerprint,
            owner_identity: if owner_identity.is_empty() {
                None
            } else {
                Some(owner_identity)
            },
        }
    }
}

/// One cached query result. `payload_json` and `metadata_json` are opaque
/// to the store; the manager serializes/deserializes them.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub query_text: String,
    pub payload_json: String,
    pub metadata_json: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One query execution attempt, persisted for pattern analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub owner_identity: Option<String>,
    pub query_text: String,
    pub tables: Vec<TableRef>,
    pub duration_ms: Option<i64>,
    pub bytes_processed: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A new schema observation for a table; versions are assigned by the
/// store.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaSnapshot {
    pub table: TableRef,
    pub schema_json: String,
    pub row_count: Option<i64>,
    pub size_bytes: Option<i64>,
}

/// Async interface for the durable cache store and dependency index.
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// Apply any pending schema setup. Idempotent.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Cache entries ────────────────────────────────────────────────────

    /// Point lookup. Returns the entry even when expired; expiry policy
    /// lives in the manager.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Upsert: wholesale replaces any entry with the same key.
    async fn put(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Returns true if an entry was removed.
    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError>;

    /// Bump the observational hit counter.
    async fn increment_hit_count(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Page of keys whose `expires_at` is before `now`, oldest first.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CacheKey>, StoreError>;

    /// Remove every entry and every edge. Returns removed entry count.
    async fn clear(&self) -> Result<u64, StoreError>;

    // ── Dependency index ─────────────────────────────────────────────────

    /// Atomically replace the edge set for `key` (a recomputed query's
    /// referenced tables can legitimately shrink).
    async fn record_dependencies(
        &self,
        key: &CacheKey,
        tables: &[TableRef],
    ) -> Result<(), StoreError>;

    /// Remove all edges for `key` (entry deleted for an unrelated reason).
    async fn drop_dependencies(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Delete every entry depending on `table` together with all of their
    /// edges; returns the removed keys.
    async fn invalidate_by_table(&self, table: &TableRef) -> Result<Vec<CacheKey>, StoreError>;

    /// Tables the given entry depends on (diagnostics/tests).
    async fn list_dependencies(&self, key: &CacheKey) -> Result<Vec<TableRef>, StoreError>;

    // ── Aggregates for stats ─────────────────────────────────────────────

    async fn entry_count(&self) -> Result<i64, StoreError>;
    async fn storage_bytes_estimate(&self) -> Result<i64, StoreError>;
    async fn oldest_entry_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
    /// Live entries with zero dependency edges (can only expire by TTL).
    async fn untracked_entry_count(&self) -> Result<i64, StoreError>;

    // ── Query history ────────────────────────────────────────────────────

    async fn record_history(&self, record: &HistoryRecord) -> Result<(), StoreError>;
    async fn list_history(
        &self,
        owner_identity: Option<&str>,
        limit: u32,
    ) -> Result<Vec<HistoryRecord>, StoreError>;

    // ── Schema snapshots ─────────────────────────────────────────────────

    /// Persist a new snapshot; returns the assigned version (1-based,
    /// monotonic per table).
    async fn record_schema_snapshot(&self, snapshot: &SchemaSnapshot) -> Result<i32, StoreError>;
    async fn latest_schema_version(&self, table: &TableRef) -> Result<Option<i32>, StoreError>;
}
