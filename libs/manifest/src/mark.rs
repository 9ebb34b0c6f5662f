//! Content marks: cheap equality hashes over canonical JSON.
//!
//! A mark is a 64-bit digest used for change detection: pod manifests,
//! rendered environments and blob contents all carry marks so equality
//! checks never need the full payload.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Mark of an arbitrary JSON value.
///
/// `serde_json::Value` objects are BTreeMap-backed, so their serialized
/// form is canonical: keys sorted, no whitespace.
pub fn digest(value: &serde_json::Value) -> u64 {
    let canonical = serde_json::to_string(value).expect("JSON value serialization is infallible");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let out = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&out[..8]);
    u64::from_be_bytes(head)
}

/// Mark of a flat string map (metadata environments, agent marks).
pub fn of_map(map: &BTreeMap<String, String>) -> u64 {
    let value = serde_json::Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    );
    digest(&value)
}

/// Mark of a rendered text source (unit bodies, blob contents).
pub fn of_str(src: &str) -> u64 {
    digest(&serde_json::Value::String(src.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_key_order_independent() {
        let a = serde_json::json!({"b": 2, "a": 1});
        let b = serde_json::json!({"a": 1, "b": 2});
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn test_digest_value_sensitive() {
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"a": 2});
        assert_ne!(digest(&a), digest(&b));
    }

    #[test]
    fn test_of_map_deterministic() {
        let mut map = BTreeMap::new();
        map.insert("meta.first".to_string(), "1".to_string());
        map.insert("meta.second".to_string(), "2".to_string());
        assert_eq!(of_map(&map), of_map(&map.clone()));
        assert_ne!(of_map(&map), of_map(&BTreeMap::new()));
    }

    #[test]
    fn test_of_str_differs_from_empty() {
        assert_ne!(of_str("[Unit]"), of_str(""));
    }
}
