//! Deterministic fingerprinting of a query plus its result-affecting
//! parameters.
//!
//! Keyword case and insignificant whitespace never change the key; quoted
//! literals and quoted identifiers always do. Operational flags
//! (`use_cache`, `force_refresh`, `ttl`, cost limits) are deliberately not
//! part of [`KeyParams`]: a forced refresh must land on the same key as a
//! normal request.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 64-char lowercase hex SHA-256 digest identifying a cacheable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The subset of execution parameters that can change the returned rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyParams {
    /// Row limit applied by the execution engine.
    pub max_results: Option<u64>,
}

/// Compute the cache key for a query text, its result-affecting parameters,
/// and the requesting identity. Pure; equal inputs always yield equal keys.
pub fn fingerprint(query_text: &str, params: &KeyParams, owner_identity: Option<&str>) -> Fingerprint {
    let normalized = normalize_query(query_text);

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    if let Some(max_results) = params.max_results {
        hasher.update(b"max_results=");
        hasher.update(max_results.to_string().as_bytes());
    }
    hasher.update([0u8]);
    if let Some(owner) = owner_identity {
        hasher.update(owner.as_bytes());
    }

    Fingerprint(hex::encode(hasher.finalize()))
}

/// Collapse a query to canonical form: outside quoted regions, whitespace
/// runs become a single space and ASCII letters are lowercased; quoted
/// regions (single-quote, double-quote, backtick) are copied verbatim so
/// literal values keep their meaning. Leading/trailing whitespace is
/// dropped.
pub fn normalize_query(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c.is_whitespace() {
                    pending_space = true;
                    continue;
                }
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' || c == '"' || c == '`' {
                    quote = Some(c);
                    out.push(c);
                } else {
                    out.push(c.to_ascii_lowercase());
                }
            }
        }
    }

    out
}
