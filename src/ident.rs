//! Identifier generation, canonical JSON, and content hashing
//!
//! Identifiers are UUIDv7 (time-ordered) so that request and event ids sort
//! chronologically. Hashing is SHA-256 over canonical JSON: object keys
//! sorted ascending, no insignificant whitespace, numbers in shortest
//! lossless form. Both sources are behind traits so tests can pin them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Source of unique identifiers
pub trait IdSource: Send + Sync {
    /// Produce the next identifier
    fn next_id(&self) -> String;
}

/// Default identifier source: UUIDv7
#[derive(Debug, Default)]
pub struct UuidV7Source;

impl IdSource for UuidV7Source {
    fn next_id(&self) -> String {
        uuid::Uuid::now_v7().to_string()
    }
}

/// Deterministic identifier source for tests: `prefix-1`, `prefix-2`, ...
#[derive(Debug)]
pub struct SequentialIdSource {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdSource {
    /// Create a sequential source with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdSource for SequentialIdSource {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

/// SHA-256 of raw bytes, hex-encoded
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a JSON value's canonical form, hex-encoded
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Canonical JSON serialization
///
/// Object keys are sorted ascending at every nesting level. Strings use
/// serde_json's minimal escaping; numbers use serde_json's shortest
/// lossless rendering. The output contains no insignificant whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_keys_recursively() {
        let value = json!({"b": 2, "a": 1, "c": {"y": [3, {"q": 1, "p": 2}], "x": 1}});
        let canonical = canonical_json(&value);
        assert_eq!(
            canonical,
            r#"{"a":1,"b":2,"c":{"x":1,"y":[3,{"p":2,"q":1}]}}"#
        );
    }

    #[test]
    fn test_canonical_escapes_keys_and_strings() {
        let value = json!({"we\"ird": "line\nbreak"});
        let canonical = canonical_json(&value);
        assert_eq!(canonical, r#"{"we\"ird":"line\nbreak"}"#);
    }

    #[test]
    fn test_canonical_round_trip_is_stable() {
        let value = json!({"z": 1.5, "a": [true, null, "x"], "n": -7});
        let first = canonical_json(&value);
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(canonical_json(&reparsed), first);
    }

    #[test]
    fn test_hash_value_is_order_insensitive() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // SHA-256 of the empty input
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sequential_id_source() {
        let source = SequentialIdSource::new("req");
        assert_eq!(source.next_id(), "req-1");
        assert_eq!(source.next_id(), "req-2");
    }

    #[test]
    fn test_uuid_v7_ids_are_time_ordered() {
        let source = UuidV7Source;
        let a = source.next_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = source.next_id();
        assert!(a < b, "v7 ids must sort chronologically: {} vs {}", a, b);
    }
}
