//! Best-effort syntactic extraction of fully-qualified table references.
//!
//! This is a narrow scanner, not a SQL parser: it looks for dotted names
//! (`dataset.table` or `project.dataset.table`) following FROM/JOIN outside
//! of quoted string context. Malformed input is never rejected; the scanner
//! returns whatever it can recognize. Under-extraction is an accepted
//! limitation (the affected entry just expires by TTL instead of being
//! invalidated by table change); names inside string literals are skipped
//! to keep false positives out.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A fully-qualified table identifier: `dataset.table` or
/// `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef(String);

impl TableRef {
    /// Parse a dotted name with two or three non-empty parts. Returns `None`
    /// for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return None;
        }
        for part in &parts {
            if part.is_empty() || !part.chars().all(is_ident_char) {
                return None;
            }
        }
        Some(TableRef(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a table-reference scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableExtraction {
    /// Scan completed; the set may be empty.
    Found(BTreeSet<TableRef>),
    /// The text could not be scanned (unterminated quote); callers should
    /// treat this like an empty set.
    Unparseable,
}

impl TableExtraction {
    /// The recognized tables, or an empty set for unparseable input.
    pub fn into_tables(self) -> BTreeSet<TableRef> {
        match self {
            TableExtraction::Found(tables) => tables,
            TableExtraction::Unparseable => BTreeSet::new(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Scan `sql` for table references following FROM/JOIN. Pure; no side
/// effects.
pub fn extract_tables(sql: &str) -> TableExtraction {
    let chars: Vec<char> = sql.chars().collect();
    let mut tables = BTreeSet::new();
    let mut expect_table = false;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            // String literal (BigQuery treats double quotes as strings too).
            match skip_string(&chars, i, c) {
                Some(next) => {
                    i = next;
                    expect_table = false;
                }
                None => return TableExtraction::Unparseable,
            }
        } else if c == '`' {
            match read_backticked(&chars, i) {
                Some((content, next)) => {
                    if expect_table {
                        if let Some(table) = TableRef::parse(&content) {
                            tables.insert(table);
                            expect_table = list_continues(&chars, next);
                        } else {
                            expect_table = false;
                        }
                    }
                    i = next;
                }
                None => return TableExtraction::Unparseable,
            }
        } else if is_ident_char(c) || c == '.' {
            let start = i;
            while i < chars.len() && (is_ident_char(chars[i]) || chars[i] == '.') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if expect_table {
                if let Some(table) = TableRef::parse(&word) {
                    tables.insert(table);
                    expect_table = list_continues(&chars, i);
                } else {
                    expect_table = false;
                }
            } else {
                expect_table =
                    word.eq_ignore_ascii_case("from") || word.eq_ignore_ascii_case("join");
            }
        } else {
            i += 1;
        }
    }

    TableExtraction::Found(tables)
}

/// Skip past a quoted string starting at `start` (which holds the opening
/// quote). Doubled quotes are treated as escapes. Returns the index just
/// past the closing quote, or `None` if unterminated.
fn skip_string(chars: &[char], start: usize, quote: char) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

/// Read a backtick-quoted identifier starting at `start`. Returns the inner
/// content and the index just past the closing backtick.
fn read_backticked(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut i = start + 1;
    let mut content = String::new();
    while i < chars.len() {
        if chars[i] == '`' {
            return Some((content, i + 1));
        }
        content.push(chars[i]);
        i += 1;
    }
    None
}

/// After a captured table name, a comma means another table follows
/// (old-style join lists: `FROM a.b, c.d`).
fn list_continues(chars: &[char], mut i: usize) -> bool {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    chars.get(i) == Some(&',')
}
