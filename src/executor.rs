//! Boundary to the external execution engine.
//!
//! The warehouse itself is an external collaborator reached over network
//! RPC; this module only defines the trait the cache core calls, the
//! outcome/statistics shapes, and the read-only guard applied before any
//! dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by the execution engine. Payloads are strings so the
/// error can be cloned to every single-flight waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecuteError {
    /// The query would exceed the configured cost limit.
    #[error("query quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The query is invalid or not allowed (includes read-only violations).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The engine did not answer in time.
    #[error("query timed out: {0}")]
    Timeout(String),

    /// The engine is temporarily unreachable.
    #[error("execution engine unavailable: {0}")]
    Unavailable(String),
}

/// Engine-reported execution statistics, stored as cache entry metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionStats {
    pub bytes_processed: Option<i64>,
    pub row_count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

/// One column of a result schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A serializable result set: rows plus column schema. Opaque to the cache
/// layer, which only moves it in and out of the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultPayload {
    pub rows: Vec<serde_json::Value>,
    pub schema: Vec<ColumnSchema>,
}

/// The full outcome of one engine execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub payload: ResultPayload,
    pub stats: ExecutionStats,
}

/// Operational knobs forwarded to the engine. None of these participate in
/// the cache fingerprint except `max_results` (see [`crate::fingerprint`]).
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Upper bound on bytes the engine may bill for this query.
    pub max_bytes_billed: Option<i64>,
    /// Row limit applied to the result.
    pub max_results: Option<u64>,
}

/// Async interface to the execution engine.
#[async_trait]
pub trait QueryExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, sql: &str, opts: &ExecuteOptions)
        -> Result<QueryOutcome, ExecuteError>;
}

/// Keywords that mutate data. Queries containing any of these as a word
/// outside quoted context are rejected before dispatch.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "MERGE", "TRUNCATE",
];

/// Reject data-mutating statements. Word-wise check outside quoted regions,
/// so column names like `created_at` or literals containing the words do
/// not trip it.
pub fn ensure_read_only(sql: &str) -> Result<(), ExecuteError> {
    for word in words_outside_quotes(sql) {
        let upper = word.to_ascii_uppercase();
        if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
            return Err(ExecuteError::InvalidQuery(format!(
                "only READ operations are allowed (found {})",
                upper
            )));
        }
    }
    Ok(())
}

/// Split the text into identifier-ish words, skipping quoted regions.
/// Unterminated quotes end the scan early, which fails safe: the dangling
/// region is not searched, but neither can it hide a keyword outside it.
fn words_outside_quotes(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' || c == '`' {
                    quote = Some(c);
                    if !current.is_empty() {
                        words.push(std::mem::take(&mut current));
                    }
                } else if c.is_ascii_alphanumeric() || c == '_' {
                    current.push(c);
                } else if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_plain_select() {
        assert!(ensure_read_only("SELECT * FROM sales.orders WHERE id = 1").is_ok());
    }

    #[test]
    fn rejects_mutating_statements() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "DELETE FROM t",
            "DROP TABLE t",
            "CREATE TABLE t (a INT)",
            "ALTER TABLE t ADD COLUMN b INT",
            "MERGE INTO t USING s ON t.id = s.id",
            "TRUNCATE TABLE t",
        ] {
            assert!(
                matches!(ensure_read_only(sql), Err(ExecuteError::InvalidQuery(_))),
                "expected rejection for {:?}",
                sql
            );
        }
    }

    #[test]
    fn allows_keywords_as_substrings() {
        assert!(ensure_read_only("SELECT created_at, updated_count FROM t.log").is_ok());
    }

    #[test]
    fn allows_keywords_inside_string_literals() {
        assert!(ensure_read_only("SELECT * FROM t.log WHERE action = 'DELETE'").is_ok());
    }

    #[test]
    fn rejects_lowercase_and_multiline() {
        assert!(ensure_read_only("select 1;\ndrop table t").is_err());
    }
}
