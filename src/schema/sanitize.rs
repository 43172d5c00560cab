//! Deterministic identifier sanitization.
//!
//! The same logical name always maps to the same physical identifier:
//! case-folded, invalid characters collapsed to `_`, reserved words suffixed,
//! and long names shortened with a stable hash so they fit the 63 byte limit.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use super::descriptor::TableKey;

/// Longest identifier Postgres keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

const HASH_HEX_LEN: usize = 8;

/// Prefix for every adapter-materialized table.
pub const TABLE_PREFIX: &str = "ds_";

const RESERVED_WORDS: &[&str] = &[
    "all", "and", "any", "as", "asc", "between", "by", "case", "check", "column", "constraint",
    "create", "default", "delete", "desc", "distinct", "drop", "else", "end", "exists", "false",
    "for", "foreign", "from", "grant", "group", "having", "in", "index", "insert", "into", "is",
    "join", "key", "like", "limit", "not", "null", "offset", "on", "or", "order", "primary",
    "references", "select", "set", "table", "then", "to", "true", "union", "unique", "update",
    "user", "using", "values", "when", "where", "with",
];

fn invalid_chars() -> &'static Regex {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    INVALID.get_or_init(|| Regex::new(r"[^a-z0-9_]+").expect("identifier pattern is valid"))
}

/// Sanitize an arbitrary logical name into a safe SQL identifier.
pub fn sanitize_identifier(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let replaced = invalid_chars().replace_all(&lowered, "_");
    let mut name = replaced.trim_matches('_').to_string();

    if name.is_empty() {
        name = "field".to_string();
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name = format!("f_{name}");
    }

    if RESERVED_WORDS.contains(&name.as_str()) {
        name.push('_');
    }

    shorten(name)
}

/// Physical column for a declared field name.
pub fn column_name(field: &str) -> String {
    sanitize_identifier(field)
}

/// Physical table for a table key: `ds_<source>_<dataset>`, sanitized.
pub fn physical_table_name(table_key: &TableKey) -> String {
    sanitize_identifier(&format!(
        "{TABLE_PREFIX}{}_{}",
        table_key.source(),
        table_key.dataset()
    ))
}

fn shorten(name: String) -> String {
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    // Sanitized names are ASCII, so byte slicing stays on char boundaries.
    let keep = MAX_IDENTIFIER_LEN - HASH_HEX_LEN - 1;
    format!("{}_{}", &name[..keep], &digest[..HASH_HEX_LEN])
}
