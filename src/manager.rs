//! Cache manager: the public entry point tying fingerprinting, the store,
//! the dependency index, single-flight coordination, and the execution
//! engine together.
//!
//! Policy lives here: expiry checks, corrupt-entry handling, and the rule
//! that a store failure degrades to direct computation instead of failing
//! the request. Compute failures always escalate and are never cached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{CacheConfig, ExecutorConfig};
use crate::error::CacheError;
use crate::events::{CacheEvent, EventSink, TracingEventSink};
use crate::executor::{
    ensure_read_only, ExecuteOptions, ExecutionStats, QueryExecutor, QueryOutcome, ResultPayload,
};
use crate::extract::{extract_tables, TableExtraction, TableRef};
use crate::fingerprint::{fingerprint, KeyParams};
use crate::id::generate_query_id;
use crate::singleflight::SingleFlight;
use crate::store::{CacheEntry, CacheKey, CacheStore, HistoryRecord, SchemaSnapshot};

/// Per-call options. Every recognized knob is enumerated here; anything a
/// caller wants beyond these is not silently accepted.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Tenant/user partition for the cache entry. `None` = globally shared.
    pub owner_identity: Option<String>,
    /// false: never read or write the store for this call.
    pub use_cache: bool,
    /// true: bypass any cached entry, recompute, overwrite the store.
    pub force_refresh: bool,
    /// Entry time-to-live; defaults to the configured TTL.
    pub ttl: Option<Duration>,
    /// Cost cap forwarded to the engine; defaults from config.
    pub max_bytes_billed: Option<i64>,
    /// Row limit forwarded to the engine. Part of the fingerprint.
    pub max_results: Option<u64>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            owner_identity: None,
            use_cache: true,
            force_refresh: false,
            ttl: None,
            max_bytes_billed: None,
            max_results: None,
        }
    }
}

/// How a call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Valid unexpired entry returned from the store.
    Hit,
    /// No usable entry; computed (and stored, if caching is on).
    Miss,
    /// Caller forced recomputation past a possibly-valid entry.
    Forced,
    /// Caching was off for this call; computed without touching the store.
    Disabled,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Forced => "forced",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of [`CacheManager::get_or_compute`].
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub query_id: String,
    pub outcome: Arc<QueryOutcome>,
    pub status: CacheStatus,
    /// When the returned payload was originally computed (hits only).
    pub cached_at: Option<DateTime<Utc>>,
}

/// Target of an explicit invalidation.
#[derive(Debug, Clone)]
pub enum InvalidationScope {
    /// Every entry depending on this table.
    Table(TableRef),
    /// One specific entry.
    Entry(CacheKey),
    /// The whole cache.
    All,
}

/// Aggregate view over the cache. Hit/miss counts are cumulative process
/// counters, not store scans.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entry_count: i64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub hit_rate: f64,
    pub storage_bytes_estimate: i64,
    pub oldest_entry_age_secs: Option<i64>,
    /// Entries with no dependency edges; they can only expire by TTL.
    pub untracked_entries: i64,
}

/// Outcome of [`CacheManager::track_schema_change`].
#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub version: i32,
    pub invalidated: Vec<CacheKey>,
}

/// Orchestrates the cache. Construct via [`CacheManager::builder`]; all
/// collaborators are injected so tests can substitute in-memory fakes.
#[derive(Debug)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    executor: Arc<dyn QueryExecutor>,
    sink: Arc<dyn EventSink>,
    cache_config: CacheConfig,
    executor_config: ExecutorConfig,
    flight: SingleFlight<QueryOutcome>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::new()
    }

    /// Look up or compute the result for a read-only query.
    #[tracing::instrument(
        name = "get_or_compute",
        skip(self, query_text, opts),
        fields(
            querygate.fingerprint = tracing::field::Empty,
            querygate.cache_status = tracing::field::Empty,
        )
    )]
    pub async fn get_or_compute(
        &self,
        query_text: &str,
        opts: &QueryOptions,
    ) -> Result<CachedResult, CacheError> {
        let query_id = generate_query_id();

        // Defense-in-depth: reject mutating statements before any cache or
        // engine work. A rejection is a hard failure and is never cached.
        if let Err(e) = ensure_read_only(query_text) {
            if self.cache_config.history_enabled {
                let record = HistoryRecord {
                    owner_identity: opts.owner_identity.clone(),
                    query_text: query_text.to_string(),
                    tables: Vec::new(),
                    duration_ms: None,
                    bytes_processed: None,
                    success: false,
                    error_message: Some(e.to_string()),
                    created_at: Utc::now(),
                };
                if let Err(err) = self.store.record_history(&record).await {
                    warn!(error = %err, "failed to record rejected query in history");
                }
            }
            return Err(CacheError::Compute(e));
        }

        let params = KeyParams {
            max_results: opts.max_results,
        };
        let fp = fingerprint(query_text, &params, opts.owner_identity.as_deref());
        let key = CacheKey::new(fp.into_string(), opts.owner_identity.clone());
        tracing::Span::current().record("querygate.fingerprint", key.fingerprint.as_str());

        let status = if !opts.use_cache {
            CacheStatus::Disabled
        } else if opts.force_refresh {
            CacheStatus::Forced
        } else {
            match self.try_cached(&key, &query_id).await {
                Some(result) => {
                    tracing::Span::current().record("querygate.cache_status", result.status.as_str());
                    return Ok(result);
                }
                None => CacheStatus::Miss,
            }
        };

        if status != CacheStatus::Disabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        if status == CacheStatus::Miss {
            self.sink.emit(&CacheEvent::Miss { key: key.clone() });
        }
        tracing::Span::current().record("querygate.cache_status", status.as_str());

        let ttl = opts
            .ttl
            .unwrap_or(Duration::from_secs(self.cache_config.ttl_secs));
        let exec_opts = ExecuteOptions {
            max_bytes_billed: Some(
                opts.max_bytes_billed
                    .unwrap_or(self.executor_config.max_bytes_billed),
            ),
            max_results: opts.max_results,
        };

        let compute = compute_and_store(
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            Arc::clone(&self.sink),
            query_text.to_string(),
            key.clone(),
            exec_opts,
            ttl,
            opts.use_cache,
            self.cache_config.history_enabled,
        );

        let outcome = self.flight.run(&key, compute).await?;

        Ok(CachedResult {
            query_id,
            outcome,
            status,
            cached_at: None,
        })
    }

    /// Attempt to satisfy the call from the store. Returns `None` on miss,
    /// expiry, corruption, or store failure; the caller computes instead.
    async fn try_cached(&self, key: &CacheKey, query_id: &str) -> Option<CachedResult> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                // The cache is an optimization, never a dependency: degrade
                // to direct computation.
                warn!(error = %e, "cache store get failed; computing directly");
                self.sink.emit(&CacheEvent::StoreError {
                    operation: "get",
                    message: e.to_string(),
                });
                return None;
            }
        };

        if entry.is_expired(Utc::now()) {
            return None;
        }

        let payload: ResultPayload = match serde_json::from_str(&entry.payload_json) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(fingerprint = %key.fingerprint, error = %e, "corrupt cache entry; dropping");
                self.sink
                    .emit(&CacheEvent::CorruptEntryDropped { key: key.clone() });
                if let Err(err) = self.store.delete(key).await {
                    warn!(error = %err, "failed to delete corrupt entry");
                }
                if let Err(err) = self.store.drop_dependencies(key).await {
                    warn!(error = %err, "failed to drop edges of corrupt entry");
                }
                return None;
            }
        };
        let stats: ExecutionStats = serde_json::from_str(&entry.metadata_json).unwrap_or_default();

        if let Err(e) = self.store.increment_hit_count(key).await {
            warn!(error = %e, "failed to increment hit count");
        }
        self.hits.fetch_add(1, Ordering::Relaxed);

        let age_secs = (Utc::now() - entry.created_at).num_seconds();
        self.sink.emit(&CacheEvent::Hit {
            key: key.clone(),
            age_secs,
        });

        Some(CachedResult {
            query_id: query_id.to_string(),
            outcome: Arc::new(QueryOutcome { payload, stats }),
            status: CacheStatus::Hit,
            cached_at: Some(entry.created_at),
        })
    }

    /// Explicitly invalidate cached results. Returns the number of entries
    /// removed.
    #[tracing::instrument(name = "invalidate", skip(self, scope))]
    pub async fn invalidate(&self, scope: InvalidationScope) -> Result<u64, CacheError> {
        let (label, removed) = match &scope {
            InvalidationScope::Table(table) => {
                let keys = self.store.invalidate_by_table(table).await?;
                (format!("table:{}", table), keys.len() as u64)
            }
            InvalidationScope::Entry(key) => {
                let deleted = self.store.delete(key).await?;
                self.store.drop_dependencies(key).await?;
                (
                    format!("entry:{}", key.fingerprint),
                    if deleted { 1 } else { 0 },
                )
            }
            InvalidationScope::All => {
                let removed = self.store.clear().await?;
                ("all".to_string(), removed)
            }
        };

        info!(scope = %label, removed, "cache invalidated");
        self.sink.emit(&CacheEvent::Invalidated {
            scope: label,
            removed,
        });
        Ok(removed)
    }

    /// Record a new schema version for a table and invalidate every cached
    /// result depending on it.
    #[tracing::instrument(name = "track_schema_change", skip(self, schema_json), fields(querygate.table = %table))]
    pub async fn track_schema_change(
        &self,
        table: &TableRef,
        schema_json: &str,
        row_count: Option<i64>,
        size_bytes: Option<i64>,
    ) -> Result<SchemaChange, CacheError> {
        let snapshot = SchemaSnapshot {
            table: table.clone(),
            schema_json: schema_json.to_string(),
            row_count,
            size_bytes,
        };
        let version = self.store.record_schema_snapshot(&snapshot).await?;
        let invalidated = self.store.invalidate_by_table(table).await?;

        info!(
            table = %table,
            version,
            invalidated = invalidated.len(),
            "schema change tracked"
        );
        self.sink.emit(&CacheEvent::Invalidated {
            scope: format!("table:{}", table),
            removed: invalidated.len() as u64,
        });

        Ok(SchemaChange {
            version,
            invalidated,
        })
    }

    /// Read-only aggregate view of the cache.
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let entry_count = self.store.entry_count().await?;
        let storage_bytes_estimate = self.store.storage_bytes_estimate().await?;
        let oldest = self.store.oldest_entry_created_at().await?;
        let untracked_entries = self.store.untracked_entry_count().await?;

        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let lookups = hit_count + miss_count;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hit_count as f64 / lookups as f64
        };

        Ok(CacheStats {
            entry_count,
            hit_count,
            miss_count,
            hit_rate,
            storage_bytes_estimate,
            oldest_entry_age_secs: oldest.map(|t| (Utc::now() - t).num_seconds().max(0)),
            untracked_entries,
        })
    }

    /// Remove every expired entry and its dependency edges. Safe to run
    /// concurrently with itself; a second pass simply finds nothing left.
    #[tracing::instrument(name = "cleanup", skip(self))]
    pub async fn cleanup(&self) -> Result<u64, CacheError> {
        let batch = self.cache_config.cleanup_batch_size.max(1);
        let mut removed = 0u64;

        loop {
            let keys = self.store.list_expired(Utc::now(), batch).await?;
            if keys.is_empty() {
                break;
            }
            let page_len = keys.len();
            for key in keys {
                if self.store.delete(&key).await? {
                    removed += 1;
                }
                self.store.drop_dependencies(&key).await?;
            }
            if page_len < batch as usize {
                break;
            }
        }

        info!(removed, "cleanup sweep completed");
        self.sink.emit(&CacheEvent::CleanupCompleted { removed });
        Ok(removed)
    }

    /// Recent query history, newest first.
    pub async fn history(
        &self,
        owner_identity: Option<&str>,
        limit: u32,
    ) -> Result<Vec<HistoryRecord>, CacheError> {
        Ok(self.store.list_history(owner_identity, limit).await?)
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }
}

/// The expensive path behind the single-flight slot: execute, extract
/// dependencies, persist entry + edges, append history. Store failures are
/// logged and swallowed; engine failures propagate.
#[allow(clippy::too_many_arguments)]
async fn compute_and_store(
    store: Arc<dyn CacheStore>,
    executor: Arc<dyn QueryExecutor>,
    sink: Arc<dyn EventSink>,
    query_text: String,
    key: CacheKey,
    exec_opts: ExecuteOptions,
    ttl: Duration,
    write_store: bool,
    history_enabled: bool,
) -> Result<QueryOutcome, CacheError> {
    let started = Utc::now();
    let result = executor.execute(&query_text, &exec_opts).await;

    let tables: Vec<TableRef> = match extract_tables(&query_text) {
        TableExtraction::Found(tables) => tables.into_iter().collect(),
        TableExtraction::Unparseable => Vec::new(),
    };

    match result {
        Ok(outcome) => {
            let mut stored = false;
            if write_store {
                stored = persist_entry(&*store, &sink, &query_text, &key, &outcome, ttl, &tables)
                    .await;
            }
            sink.emit(&CacheEvent::Computed {
                key: key.clone(),
                duration_ms: outcome.stats.duration_ms,
                stored,
            });

            if history_enabled {
                let record = HistoryRecord {
                    owner_identity: key.owner_identity.clone(),
                    query_text,
                    tables,
                    duration_ms: outcome.stats.duration_ms,
                    bytes_processed: outcome.stats.bytes_processed,
                    success: true,
                    error_message: None,
                    created_at: Utc::now(),
                };
                if let Err(e) = store.record_history(&record).await {
                    warn!(error = %e, "failed to record query history");
                }
            }

            Ok(outcome)
        }
        Err(e) => {
            if history_enabled {
                let record = HistoryRecord {
                    owner_identity: key.owner_identity.clone(),
                    query_text,
                    tables,
                    duration_ms: Some((Utc::now() - started).num_milliseconds()),
                    bytes_processed: None,
                    success: false,
                    error_message: Some(e.to_string()),
                    created_at: Utc::now(),
                };
                if let Err(err) = store.record_history(&record).await {
                    warn!(error = %err, "failed to record failed query in history");
                }
            }
            Err(CacheError::Compute(e))
        }
    }
}

/// Write the entry and replace its edges. Returns whether the entry landed
/// in the store.
async fn persist_entry(
    store: &dyn CacheStore,
    sink: &Arc<dyn EventSink>,
    query_text: &str,
    key: &CacheKey,
    outcome: &QueryOutcome,
    ttl: Duration,
    tables: &[TableRef],
) -> bool {
    let (payload_json, metadata_json) = match (
        serde_json::to_string(&outcome.payload),
        serde_json::to_string(&outcome.stats),
    ) {
        (Ok(p), Ok(m)) => (p, m),
        (p, m) => {
            let err = p.err().or(m.err()).map(|e| e.to_string()).unwrap_or_default();
            warn!(error = %err, "failed to serialize result for caching");
            return false;
        }
    };

    let created_at = Utc::now();
    let entry = CacheEntry {
        key: key.clone(),
        query_text: query_text.to_string(),
        payload_json,
        metadata_json,
        created_at,
        expires_at: created_at + chrono::Duration::milliseconds(ttl.as_millis() as i64),
        hit_count: 0,
    };

    if let Err(e) = store.put(&entry).await {
        warn!(error = %e, "failed to write cache entry");
        sink.emit(&CacheEvent::StoreError {
            operation: "put",
            message: e.to_string(),
        });
        return false;
    }

    if tables.is_empty() {
        sink.emit(&CacheEvent::NoDependencies { key: key.clone() });
    }
    if let Err(e) = store.record_dependencies(key, tables).await {
        warn!(error = %e, "failed to record dependency edges");
        sink.emit(&CacheEvent::StoreError {
            operation: "record_dependencies",
            message: e.to_string(),
        });
    }

    true
}

/// Builder for [`CacheManager`]. Store and executor are required; the event
/// sink defaults to tracing output and configs to their defaults.
#[derive(Debug, Default)]
pub struct CacheManagerBuilder {
    store: Option<Arc<dyn CacheStore>>,
    executor: Option<Arc<dyn QueryExecutor>>,
    sink: Option<Arc<dyn EventSink>>,
    cache_config: Option<CacheConfig>,
    executor_config: Option<ExecutorConfig>,
}

impl CacheManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn QueryExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = Some(config);
        self
    }

    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = Some(config);
        self
    }

    pub fn build(self) -> Result<CacheManager> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("CacheManager requires a store"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("CacheManager requires an executor"))?;

        Ok(CacheManager {
            store,
            executor,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingEventSink)),
            cache_config: self.cache_config.unwrap_or_default(),
            executor_config: self.executor_config.unwrap_or_default(),
            flight: SingleFlight::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }
}
