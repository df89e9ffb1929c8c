//! Deterministic, lossy-but-labeled truncation of client-supplied payloads so
//! ingestion never fails because a record is too large for the store.
//!
//! Three strategies are tried in order, each checked against the same byte
//! ceiling: pass-through, inner-string truncation, key dropping. Byte counts
//! are measured against the canonical JSON serialization of the value.

use std::collections::HashSet;

use serde_json::{Map, Value};

/// `metadata` ceiling (bytes).
pub const MAX_METADATA_SIZE: usize = 10_000;
/// span `input_data`/`output_data` ceiling (bytes).
pub const MAX_INPUT_OUTPUT_SIZE: usize = 50_000;
/// free-form string field ceiling (chars) — `output`, `error`.
pub const MAX_STRING_LENGTH: usize = 10_000;
/// total stored-item safety margin (bytes), informational — enforced by the
/// storage layer rejecting anything still over this after size-guarding.
pub const MAX_ITEM_SIZE: usize = 350_000;

/// Default per-string cap used by the inner-string-truncation strategy.
const INNER_STRING_CAP: usize = 1_000;

fn byte_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Truncate a single string to `max` chars, using the standalone-field cut:
/// `<first (max-50) chars> + "\n... [truncated, was K chars]"`. Used for
/// free-form string fields (`output`, `error`), not for values nested inside
/// a mapping (those go through [`truncate_inner_string`]).
pub fn truncate_string(s: &str, max: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(50);
    let head: String = s.chars().take(keep).collect();
    format!("{head}\n... [truncated, was {char_count} chars]")
}

fn truncate_inner_string(s: &str, cap: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= cap {
        return s.to_string();
    }
    let head: String = s.chars().take(cap).collect();
    format!("{head}... [truncated, was {char_count} chars]")
}

/// Recursively rewrite every string in a JSON value, truncating any string
/// longer than `cap` chars. Walks objects and arrays; scalars other than
/// strings pass through unchanged.
fn truncate_strings_recursive(value: &Value, cap: usize) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_inner_string(s, cap)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| truncate_strings_recursive(v, cap))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), truncate_strings_recursive(v, cap));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Apply the three-strategy truncation pipeline to a mapping-shaped payload
/// (`metadata`, `input_data`, `output_data`) against `ceiling` bytes.
///
/// Non-object inputs (caller passed a scalar) are returned unchanged — the
/// pipeline only operates on mappings, matching spec.md §4.1's "walk the
/// mapping recursively" framing.
pub fn truncate_payload(value: Value, ceiling: usize) -> Value {
    let Value::Object(map) = value else {
        return value;
    };
    let original = Value::Object(map.clone());
    if byte_len(&original) <= ceiling {
        return original;
    }

    // Strategy 2: inner-string truncation.
    let rewritten = truncate_strings_recursive(&original, INNER_STRING_CAP);
    if byte_len(&rewritten) <= ceiling {
        let mut out = match rewritten {
            Value::Object(m) => m,
            _ => unreachable!("object in, object out"),
        };
        out.insert("_truncated".to_string(), Value::Bool(true));
        return Value::Object(out);
    }

    // Strategy 3: key dropping. Starts over from the untouched payload —
    // `_original_size` must reflect the pre-truncation byte count, not
    // strategy 2's already-shortened strings.
    let original_size = byte_len(&original);
    let mut map = match original {
        Value::Object(m) => m,
        _ => unreachable!("object in, object out"),
    };
    let mut dropped: HashSet<String> = HashSet::new();

    loop {
        if byte_len(&Value::Object(map.clone())) <= ceiling {
            break;
        }
        let largest_key = map
            .iter()
            .filter(|(k, _)| !dropped.contains(*k) && k.as_str() != "_truncated")
            .max_by_key(|(_, v)| byte_len(v))
            .map(|(k, _)| k.clone());

        let Some(key) = largest_key else {
            // No droppable keys remain; stop to avoid an infinite loop.
            break;
        };
        let size = map.get(&key).map(byte_len).unwrap_or(0);
        map.insert(key.clone(), Value::String(format!("[dropped: {size} bytes]")));
        dropped.insert(key);
    }

    map.insert("_truncated".to_string(), Value::Bool(true));
    map.insert(
        "_original_size".to_string(),
        Value::Number(original_size.into()),
    );
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_when_already_small() {
        let v = serde_json::json!({"a": "hello"});
        let out = truncate_payload(v.clone(), MAX_METADATA_SIZE);
        assert_eq!(out, v);
    }

    #[test]
    fn inner_string_truncation_tags_payload() {
        let long = "x".repeat(5_000);
        let v = serde_json::json!({"prompt": long});
        let out = truncate_payload(v, MAX_INPUT_OUTPUT_SIZE.min(2_000));
        assert_eq!(out["_truncated"], Value::Bool(true));
        let prompt = out["prompt"].as_str().unwrap();
        assert!(prompt.ends_with("... [truncated, was 5000 chars]"));
    }

    #[test]
    fn key_dropping_marks_original_size() {
        let mut obj = Map::new();
        for i in 0..50 {
            obj.insert(format!("k{i}"), Value::String("y".repeat(2_000)));
        }
        let out = truncate_payload(Value::Object(obj), 5_000);
        assert_eq!(out["_truncated"], Value::Bool(true));
        assert!(out.get("_original_size").is_some());
        assert!(byte_len(&out) <= 5_000 || out["k0"].as_str().unwrap().starts_with("[dropped"));
    }

    #[test]
    fn standalone_string_truncation_uses_newline_suffix() {
        let s = "a".repeat(20);
        let out = truncate_string(&s, 10);
        assert!(out.contains("\n... [truncated, was 20 chars]"));
    }

    #[test]
    fn metadata_value_exactly_at_ceiling_is_unchanged() {
        // boundary case from spec.md §8: exactly MAX_METADATA_SIZE bytes.
        let s = "a".repeat(MAX_METADATA_SIZE - 10);
        let v = serde_json::json!({"note": s});
        let size = byte_len(&v);
        let out = truncate_payload(v.clone(), size);
        assert_eq!(out, v);
    }
}
