//! In-memory cache store for tests and embedded use.
//!
//! Keeps the same observable semantics as the SQL backends and can be
//! configured to fail reads or writes for exercising the manager's
//! degraded paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CacheEntry, CacheKey, CacheStore, HistoryRecord, SchemaSnapshot, StoreError};
use crate::extract::TableRef;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<(String, String), CacheEntry>,
    /// (table_ref, fingerprint, owner) triples.
    edges: BTreeSet<(String, String, String)>,
    history: Vec<HistoryRecord>,
    schema_versions: HashMap<String, i32>,
}

#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    inner: Mutex<Inner>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read operation fail with `StoreError::Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write operation fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store write failure".into()));
        }
        Ok(())
    }

    fn map_key(key: &CacheKey) -> (String, String) {
        (key.fingerprint.clone(), key.owner_column().to_string())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.check_read()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.get(&Self::map_key(key)).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.check_write()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .insert(Self::map_key(&entry.key), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.check_write()?;
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.entries.remove(&Self::map_key(key)).is_some())
    }

    async fn increment_hit_count(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.check_write()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&Self::map_key(key)) {
            entry.hit_count += 1;
        }
        Ok(())
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CacheKey>, StoreError> {
        self.check_read()?;
        let inner = self.inner.lock().unwrap();
        let mut expired: Vec<&CacheEntry> = inner
            .entries
            .values()
            .filter(|e| e.expires_at < now)
            .collect();
        expired.sort_by_key(|e| e.expires_at);
        Ok(expired
            .into_iter()
            .take(limit as usize)
            .map(|e| e.key.clone())
            .collect())
    }

    async fn clear(&self) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.entries.len() as u64;
        inner.entries.clear();
        inner.edges.clear();
        Ok(removed)
    }

    async fn record_dependencies(
        &self,
        key: &CacheKey,
        tables: &[TableRef],
    ) -> Result<(), StoreError> {
        self.check_write()?;
        let (fingerprint, owner) = Self::map_key(key);
        let mut inner = self.inner.lock().unwrap();
        inner
            .edges
            .retain(|(_, f, o)| !(f == &fingerprint && o == &owner));
        for table in tables {
            inner
                .edges
                .insert((table.as_str().to_string(), fingerprint.clone(), owner.clone()));
        }
        Ok(())
    }

    async fn drop_dependencies(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.check_write()?;
        let (fingerprint, owner) = Self::map_key(key);
        let mut inner = self.inner.lock().unwrap();
        inner
            .edges
            .retain(|(_, f, o)| !(f == &fingerprint && o == &owner));
        Ok(())
    }

    async fn invalidate_by_table(&self, table: &TableRef) -> Result<Vec<CacheKey>, StoreError> {
        self.check_write()?;
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<(String, String)> = inner
            .edges
            .iter()
            .filter(|(t, _, _)| t == table.as_str())
            .map(|(_, f, o)| (f.clone(), o.clone()))
            .collect();

        for (fingerprint, owner) in &keys {
            inner.entries.remove(&(fingerprint.clone(), owner.clone()));
            inner
                .edges
                .retain(|(_, f, o)| !(f == fingerprint && o == owner));
        }

        Ok(keys
            .into_iter()
            .map(|(f, o)| CacheKey::from_columns(f, o))
            .collect())
    }

    async fn list_dependencies(&self, key: &CacheKey) -> Result<Vec<TableRef>, StoreError> {
        self.check_read()?;
        let (fingerprint, owner) = Self::map_key(key);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .edges
            .iter()
            .filter(|(_, f, o)| f == &fingerprint && o == &owner)
            .filter_map(|(t, _, _)| TableRef::parse(t))
            .collect())
    }

    async fn entry_count(&self) -> Result<i64, StoreError> {
        self.check_read()?;
        Ok(self.inner.lock().unwrap().entries.len() as i64)
    }

    async fn storage_bytes_estimate(&self) -> Result<i64, StoreError> {
        self.check_read()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .values()
            .map(|e| e.payload_json.len() as i64)
            .sum())
    }

    async fn oldest_entry_created_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.check_read()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.entries.values().map(|e| e.created_at).min())
    }

    async fn untracked_entry_count(&self) -> Result<i64, StoreError> {
        self.check_read()?;
        let inner = self.inner.lock().unwrap();
        let count = inner
            .entries
            .values()
            .filter(|e| {
                let (fingerprint, owner) = Self::map_key(&e.key);
                !inner
                    .edges
                    .iter()
                    .any(|(_, f, o)| f == &fingerprint && o == &owner)
            })
            .count();
        Ok(count as i64)
    }

    async fn record_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.lock().unwrap().history.push(record.clone());
        Ok(())
    }

    async fn list_history(
        &self,
        owner_identity: Option<&str>,
        limit: u32,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.check_read()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .history
            .iter()
            .rev()
            .filter(|r| match owner_identity {
                Some(owner) => r.owner_identity.as_deref() == Some(owner),
                None => true,
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn record_schema_snapshot(&self, snapshot: &SchemaSnapshot) -> Result<i32, StoreError> {
        self.check_write()?;
        let mut inner = self.inner.lock().unwrap();
        let version = inner
            .schema_versions
            .entry(snapshot.table.as_str().to_string())
            .or_insert(0);
        *version += 1;
        Ok(*version)
    }

    async fn latest_schema_version(&self, table: &TableRef) -> Result<Option<i32>, StoreError> {
        self.check_read()?;
        let inner = self.inner.lock().unwrap();
        Ok(inner.schema_versions.get(table.as_str()).copied())
    }
}
