// Content-addressed digests: every on-ledger hash is over the canonical
// JSON of the underlying bundle — keys sorted, no optional/null fields,
// numbers as decimal integers at their canonical scale (spec §9).

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Recursively sort object keys and drop null-valued fields so the same
/// logical bundle always serializes to the same bytes regardless of the
/// struct's field order or which optional fields happened to be set.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                let v = &map[k];
                if v.is_null() {
                    continue;
                }
                sorted.insert(k.clone(), canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Hash the canonical form of a serializable bundle to a 32-byte digest.
pub fn digest_of<T: serde::Serialize>(value: &T) -> [u8; 32] {
    let raw = serde_json::to_value(value).expect("digest input must serialize");
    let canonical = canonicalize(&raw);
    let bytes = serde_json::to_vec(&canonical).expect("canonical value must serialize");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hasher.finalize().into()
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

pub const ZERO_DIGEST: [u8; 32] = [0u8; 32];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_keys_and_drops_nulls() {
        let v = json!({"b": 1, "a": 2, "c": null});
        let c = canonicalize(&v);
        assert_eq!(c, json!({"a": 2, "b": 1}));
    }

    #[test]
    fn digest_is_deterministic_across_field_order() {
        let a = json!({"lat": 10, "lng": 20});
        let b = json!({"lng": 20, "lat": 10});
        assert_eq!(digest_of(&a), digest_of(&b));
    }

    #[test]
    fn digest_changes_with_content() {
        let a = json!({"lat": 10});
        let b = json!({"lat": 11});
        assert_ne!(digest_of(&a), digest_of(&b));
    }
}
