// Cache key construction
//
// The remote keyspace is wire-observable and must stay stable:
//
//   {entity}:record:{column}:{value}
//   {entity}:list:v{version}:{sha256hex(canonical_query)}
//   {entity}:version
//
// canonical_query is the lex-sorted `key=urlencoded(value)` pairs joined by
// `&`. Local keys are the same strings truncated to the table's key bound;
// collisions after truncation are tolerated because the remote tier always
// carries the full key.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// RFC 3986 unreserved characters stay literal.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// The one truncation rule every local-tier caller shares.
pub fn truncate_key(key: &str, max: usize) -> &str {
    if key.len() <= max {
        return key;
    }
    let mut end = max;
    while end > 0 && !key.is_char_boundary(end) {
        end -= 1;
    }
    &key[..end]
}

/// Lex-sorted `key=urlencoded(value)` pairs joined by `&`.
pub fn canonical_query(query: &BTreeMap<String, String>) -> String {
    let mut parts = Vec::with_capacity(query.len());
    for (key, value) in query {
        parts.push(format!(
            "{}={}",
            key,
            utf8_percent_encode(value, QUERY_ENCODE)
        ));
    }
    parts.join("&")
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn record_key(entity: &str, column: &str, value: &str) -> String {
    format!("{}:record:{}:{}", entity, column, value)
}

pub fn list_key(entity: &str, version: u64, query: &BTreeMap<String, String>) -> String {
    format!(
        "{}:list:v{}:{}",
        entity,
        version,
        sha256_hex(&canonical_query(query))
    )
}

pub fn version_key(entity: &str) -> String {
    format!("{}:version", entity)
}

pub fn list_key_prefix(entity: &str) -> String {
    format!("{}:list:v", entity)
}

/// Extract the version stamp from a (possibly truncated) list key.
pub fn parse_list_version(key: &str, entity: &str) -> Option<u64> {
    let rest = key.strip_prefix(&list_key_prefix(entity))?;
    let digits = rest.split(':').next()?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_query_sorts_and_encodes() {
        let q = query(&[("page", "2"), ("filter", "a b&c")]);
        assert_eq!(canonical_query(&q), "filter=a%20b%26c&page=2");
    }

    #[test]
    fn test_canonical_query_is_order_independent() {
        let a = query(&[("a", "1"), ("b", "2")]);
        let b = query(&[("b", "2"), ("a", "1")]);
        assert_eq!(canonical_query(&a), canonical_query(&b));
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(record_key("users", "id", "7"), "users:record:id:7");
        assert_eq!(version_key("users"), "users:version");
        let key = list_key("users", 3, &query(&[("page", "1")]));
        assert!(key.starts_with("users:list:v3:"));
        // sha256 hex digest
        assert_eq!(key.len(), "users:list:v3:".len() + 64);
    }

    #[test]
    fn test_list_key_changes_with_version_and_query() {
        let q1 = query(&[("page", "1")]);
        let q2 = query(&[("page", "2")]);
        assert_ne!(list_key("users", 1, &q1), list_key("users", 2, &q1));
        assert_ne!(list_key("users", 1, &q1), list_key("users", 1, &q2));
        assert_eq!(list_key("users", 1, &q1), list_key("users", 1, &q1));
    }

    #[test]
    fn test_parse_list_version() {
        let q = query(&[("page", "1")]);
        let key = list_key("users", 12, &q);
        assert_eq!(parse_list_version(&key, "users"), Some(12));
        let truncated = truncate_key(&key, 56);
        assert_eq!(parse_list_version(&truncated, "users"), Some(12));
        assert_eq!(parse_list_version("users:record:id:1", "users"), None);
        assert_eq!(parse_list_version(&key, "items"), None);
    }

    #[test]
    fn test_truncate_key() {
        assert_eq!(truncate_key("short", 56), "short");
        let long = "x".repeat(100);
        assert_eq!(truncate_key(&long, 56).len(), 56);
        // multi-byte input never splits a char
        let wide = "é".repeat(40);
        let cut = truncate_key(&wide, 57);
        assert!(cut.len() <= 57);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
