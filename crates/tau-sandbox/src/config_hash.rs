//! Order-independent hashing of sandbox config trees.
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Canonical form used for hashing: object keys sorted, arrays made only of
/// primitives sorted, and `null` members pruned.
pub fn normalize_for_hash(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key, normalize_for_hash(value)))
                .collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            let mut normalized = Map::new();
            for (key, value) in entries {
                normalized.insert(key, value);
            }
            Value::Object(normalized)
        }
        Value::Array(items) => {
            let mut items: Vec<Value> = items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(normalize_for_hash)
                .collect();
            if items.iter().all(is_primitive) {
                items.sort_by_key(primitive_sort_key);
            }
            Value::Array(items)
        }
        other => other,
    }
}

/// SHA-256 hex digest of the normalized JSON serialization.
pub fn compute_config_hash<T: Serialize>(config: &T) -> String {
    let value = serde_json::to_value(config).unwrap_or(Value::Null);
    let normalized = normalize_for_hash(value);
    let encoded = serde_json::to_string(&normalized).unwrap_or_default();
    let digest = Sha256::digest(encoded.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn is_primitive(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn primitive_sort_key(value: &Value) -> String {
    match value {
        Value::String(text) => format!("s:{text}"),
        other => format!("v:{other}"),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn unit_normalize_sorts_keys_and_primitive_arrays_and_prunes_nulls() {
        let normalized = normalize_for_hash(json!({
            "b": [3, 1, 2],
            "a": {"z": null, "y": ["b", "a"]},
            "c": [{"k": 2}, {"k": 1}]
        }));
        assert_eq!(
            serde_json::to_string(&normalized).expect("encode"),
            r#"{"a":{"y":["a","b"]},"b":[1,2,3],"c":[{"k":2},{"k":1}]}"#
        );
    }

    #[test]
    fn unit_hash_is_hex_sha256() {
        let hash = compute_config_hash(&json!({"mode": "all"}));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn regression_string_and_number_primitives_do_not_collide() {
        assert_ne!(
            compute_config_hash(&json!({"v": ["1"]})),
            compute_config_hash(&json!({"v": [1]}))
        );
    }

    proptest! {
        #[test]
        fn property_hash_ignores_primitive_array_order(mut tools in proptest::collection::vec("[a-z_]{1,12}", 0..12), rotate in 0usize..12) {
            let original = json!({"tools": {"allow": tools.clone()}, "mode": "all"});
            if !tools.is_empty() {
                let by = rotate % tools.len();
                tools.rotate_left(by);
            }
            tools.reverse();
            let shuffled = json!({"mode": "all", "tools": {"allow": tools}});
            prop_assert_eq!(compute_config_hash(&original), compute_config_hash(&shuffled));
        }

        #[test]
        fn property_hash_changes_when_a_value_changes(image in "[a-z]{1,10}", other in "[a-z]{1,10}") {
            prop_assume!(image != other);
            prop_assert_ne!(
                compute_config_hash(&json!({"image": image})),
                compute_config_hash(&json!({"image": other}))
            );
        }
    }
}
