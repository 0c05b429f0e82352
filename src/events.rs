//! Structured cache events for the external observability collector.
//!
//! The collector owns its own schema; this module only defines what the
//! manager emits and a default sink that logs through `tracing`. Sinks must
//! be cheap and non-blocking: they are called inline on the query path.

use crate::store::CacheKey;

/// Events emitted by the cache manager.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit {
        key: CacheKey,
        age_secs: i64,
    },
    Miss {
        key: CacheKey,
    },
    Computed {
        key: CacheKey,
        duration_ms: Option<i64>,
        stored: bool,
    },
    /// The extractor found no tables for a stored entry; it can only expire
    /// by TTL.
    NoDependencies {
        key: CacheKey,
    },
    Invalidated {
        scope: String,
        removed: u64,
    },
    CorruptEntryDropped {
        key: CacheKey,
    },
    StoreError {
        operation: &'static str,
        message: String,
    },
    CleanupCompleted {
        removed: u64,
    },
}

/// Destination for cache events.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: &CacheEvent);
}

/// Default sink: structured log lines via `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &CacheEvent) {
        match event {
            CacheEvent::Hit { key, age_secs } => {
                tracing::info!(fingerprint = %key.fingerprint, age_secs = *age_secs, "cache hit");
            }
            CacheEvent::Miss { key } => {
                tracing::info!(fingerprint = %key.fingerprint, "cache miss");
            }
            CacheEvent::Computed {
                key,
                duration_ms,
                stored,
            } => {
                tracing::info!(
                    fingerprint = %key.fingerprint,
                    duration_ms = duration_ms.unwrap_or(-1),
                    stored = *stored,
                    "query computed"
                );
            }
            CacheEvent::NoDependencies { key } => {
                tracing::debug!(
                    fingerprint = %key.fingerprint,
                    "no table dependencies extracted; entry expires by TTL only"
                );
            }
            CacheEvent::Invalidated { scope, removed } => {
                tracing::info!(scope = %scope, removed = *removed, "cache invalidated");
            }
            CacheEvent::CorruptEntryDropped { key } => {
                tracing::warn!(fingerprint = %key.fingerprint, "dropped corrupt cache entry");
            }
            CacheEvent::StoreError { operation, message } => {
                tracing::warn!(operation = *operation, error = %message, "cache store error");
            }
            CacheEvent::CleanupCompleted { removed } => {
                tracing::info!(removed = *removed, "cache cleanup completed");
            }
        }
    }
}
