//! Idempotence key algebra.
//!
//! A logical task is identified by `{PHASE}:{16-hex}` where the hex half is
//! `SHA-256(canonical_json({phase, inputs, version}))` truncated to 16 hex
//! characters. Canonicalization sorts object keys recursively and encodes
//! UTF-8, so the key is invariant under input map ordering.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::plan::PhaseName;

/// Number of hex characters kept from the SHA-256 digest.
pub const KEY_HEX_LEN: usize = 16;

/// Render a JSON value in canonical form: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json string escaping is already canonical
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serialization is infallible"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 of the input, truncated to [`KEY_HEX_LEN`] hex characters.
pub fn hex16(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut hex = hex::encode(digest);
    hex.truncate(KEY_HEX_LEN);
    hex
}

/// Derive the idempotence key for a logical task.
pub fn key_of(phase: PhaseName, inputs: &Value, version: &str) -> String {
    let envelope = serde_json::json!({
        "phase": phase.as_str(),
        "inputs": inputs,
        "version": version,
    });
    format!("{}:{}", phase.as_str(), hex16(canonical_json(&envelope).as_bytes()))
}

/// Derive a dedup key for an arbitrary `(topic, payload)` pair when the
/// producer did not supply one.
pub fn derived_message_key(topic: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(topic.as_bytes());
    hasher.update(payload.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(KEY_HEX_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_key_invariant_under_key_permutation() {
        let a = json!({"story": "S1", "rubric": "clarity"});
        let b = json!({"rubric": "clarity", "story": "S1"});
        assert_eq!(
            key_of(PhaseName::Qa, &a, "1"),
            key_of(PhaseName::Qa, &b, "1")
        );
    }

    #[test]
    fn test_key_shape() {
        let key = key_of(PhaseName::Ideation, &json!({"seed": 7}), "2");
        let (phase, hash) = key.split_once(':').expect("key has a colon");
        assert_eq!(phase, "IDEATION");
        assert_eq!(hash.len(), 16);
        assert!(phase.chars().all(|c| c.is_ascii_uppercase() || c == '_'));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_key_varies_with_version_and_inputs() {
        let inputs = json!({"story": "S1"});
        let k1 = key_of(PhaseName::Qa, &inputs, "1");
        let k2 = key_of(PhaseName::Qa, &inputs, "2");
        let k3 = key_of(PhaseName::Qa, &json!({"story": "S2"}), "1");
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_derived_message_key_is_stable() {
        let a = derived_message_key("tasks", r#"{"x":1}"#);
        let b = derived_message_key("tasks", r#"{"x":1}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, derived_message_key("other", r#"{"x":1}"#));
    }
}
