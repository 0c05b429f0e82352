//! Centralized ID generation for request-scoped resources.
//!
//! Format: [4-char prefix][26-char nanoid] = 30 chars total.
//! Alphabet: lowercase alphanumeric (0-9, a-z).

/// Custom lowercase alphabet shared by all generated IDs.
const ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

const QUERY_PREFIX: &str = "qrun";

/// Generate a 30-char query run ID (prefix: "qrun").
pub fn generate_query_id() -> String {
    let suffix = nanoid::nanoid!(26, &ID_ALPHABET);
    format!("{}{}", QUERY_PREFIX, suffix)
}
