pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod extract;
pub mod fingerprint;
mod id;
mod manager;
mod singleflight;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::CacheError;
pub use events::{CacheEvent, EventSink, TracingEventSink};
pub use executor::{
    ensure_read_only, ColumnSchema, ExecuteError, ExecuteOptions, ExecutionStats, QueryExecutor,
    QueryOutcome, ResultPayload,
};
pub use extract::{extract_tables, TableExtraction, TableRef};
pub use fingerprint::{fingerprint, Fingerprint, KeyParams};
pub use manager::{
    CacheManager, CacheManagerBuilder, CacheStats, CacheStatus, CachedResult, InvalidationScope,
    QueryOptions, SchemaChange,
};
pub use store::{
    CacheEntry, CacheKey, CacheStore, HistoryRecord, MemoryCacheStore, PostgresCacheStore,
    SchemaSnapshot, SqliteCacheStore, StoreError,
};
pub use worker::CleanupWorker;
