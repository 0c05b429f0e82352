//! Error taxonomy for the cache layer.
//!
//! Store failures are recoverable (the manager falls through to direct
//! computation); compute failures always escalate to the caller. Variants
//! carry `String` payloads so outcomes stay `Clone` across single-flight
//! waiters.

use thiserror::Error;

use crate::executor::ExecuteError;
use crate::store::StoreError;

/// Errors surfaced by [`crate::CacheManager`] operations.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backing cache store could not be reached. Only raised by
    /// operations where the store is the whole point (invalidate, stats,
    /// cleanup); the query path degrades to direct computation instead.
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),

    /// The execution engine failed. Propagated verbatim; nothing is cached.
    #[error(transparent)]
    Compute(#[from] ExecuteError),

    /// A shared in-flight computation was dropped or panicked before
    /// publishing an outcome.
    #[error("in-flight computation aborted: {0}")]
    FlightAborted(String),
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        CacheError::StoreUnavailable(e.to_string())
    }
}
