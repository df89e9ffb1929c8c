//! Request validation: string/character-class constraints, tag and metadata
//! normalization, and the strict timestamp parser used at the storage
//! boundary. See spec.md §4.2 and §8 for the exact rules reproduced here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::ValidationError;
use crate::sizeguard::{self, MAX_METADATA_SIZE};

pub const MAX_NAME_LEN: usize = 255;
pub const MIN_NAME_LEN: usize = 1;
pub const MAX_PROJECT_ID_LEN: usize = 100;
pub const MIN_PROJECT_ID_LEN: usize = 1;
pub const MAX_USER_SESSION_ID_LEN: usize = 255;
pub const MAX_TAG_LEN: usize = 100;
pub const MAX_TAGS: usize = 50;
pub const MAX_OUTPUT_LEN: usize = 10_000;

/// `project_id` character-class + length check: `^[A-Za-z0-9_-]+$`, 1-100 chars.
pub fn validate_project_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.chars().count() > MAX_PROJECT_ID_LEN {
        return Err(ValidationError::LengthOutOfRange {
            field: "project_id",
            min: MIN_PROJECT_ID_LEN,
            max: MAX_PROJECT_ID_LEN,
        });
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(ValidationError::InvalidCharacters { field: "project_id" });
    }
    Ok(())
}

/// Display-name length check: 1-255 chars.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let len = name.chars().count();
    if len < MIN_NAME_LEN || len > MAX_NAME_LEN {
        return Err(ValidationError::LengthOutOfRange {
            field: "name",
            min: MIN_NAME_LEN,
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

/// `user_id`/`session_id` length check: ≤255 chars.
pub fn validate_identifier_field(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.chars().count() > MAX_USER_SESSION_ID_LEN {
        return Err(ValidationError::LengthOutOfRange {
            field,
            min: 0,
            max: MAX_USER_SESSION_ID_LEN,
        });
    }
    Ok(())
}

/// Strip empty/whitespace tags, truncate each surviving tag to
/// [`MAX_TAG_LEN`] chars, and reject (don't truncate) a list longer than
/// [`MAX_TAGS`] — matches the boundary cases in spec.md §8: a 101-char tag is
/// truncated, but a 51st tag is rejected outright.
pub fn normalize_tags(tags: Vec<String>) -> Result<Vec<String>, ValidationError> {
    let cleaned: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .map(|t| t.chars().take(MAX_TAG_LEN).collect())
        .collect();
    if cleaned.len() > MAX_TAGS {
        return Err(ValidationError::TooManyTags { max: MAX_TAGS });
    }
    Ok(cleaned)
}

/// Coerce arbitrary JSON metadata values to strings (the store rejects
/// native floats/bools/nulls inside mappings), then apply the size-guard
/// truncation pipeline against [`MAX_METADATA_SIZE`].
pub fn normalize_metadata(metadata: HashMap<String, Value>) -> HashMap<String, String> {
    let stringified: serde_json::Map<String, Value> = metadata
        .into_iter()
        .map(|(k, v)| (k, Value::String(stringify_value(&v))))
        .collect();
    let truncated = sizeguard::truncate_payload(Value::Object(stringified), MAX_METADATA_SIZE);
    value_object_to_string_map(truncated)
}

fn stringify_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_object_to_string_map(value: Value) -> HashMap<String, String> {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, s)
            })
            .collect(),
        _ => HashMap::new(),
    }
}

/// Truncate a free-form string field (`output`, `error`) to [`MAX_OUTPUT_LEN`]
/// chars using the standalone-field cut (see `sizeguard::truncate_string`).
pub fn normalize_output(s: String) -> String {
    sizeguard::truncate_string(&s, MAX_OUTPUT_LEN)
}

/// Strict RFC-3339 parse used at the storage boundary: rejects a
/// timezone-naive string outright (no offset to parse), accepts a trailing
/// `Z`. This is the "storage path" half of the two-tier strictness recorded
/// in SPEC_FULL.md §9 Open Question 3 — the HTTP boundary never actually
/// receives client-supplied timestamps (the server stamps all of them), so
/// this function's only caller is the storage layer reading its own
/// previously-written `start_time`/`end_time` columns back.
pub fn parse_rfc3339_strict(s: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ValidationError::InvalidCharacters { field: "timestamp" })
}

/// Non-negativity check for token counts / cost.
pub fn validate_non_negative_i64(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::Negative { field });
    }
    Ok(())
}

/// Non-negativity check for `cost_usd`.
pub fn validate_non_negative_decimal(field: &'static str, value: Decimal) -> Result<(), ValidationError> {
    if value < Decimal::ZERO {
        return Err(ValidationError::Negative { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_id_accepts_alnum_underscore_dash() {
        assert!(validate_project_id("dev-project_1").is_ok());
    }

    #[test]
    fn project_id_rejects_slash() {
        assert!(validate_project_id("dev/project").is_err());
    }

    #[test]
    fn tags_strip_whitespace_and_empties() {
        let out = normalize_tags(vec!["  a  ".into(), "".into(), "   ".into(), "b".into()]).unwrap();
        assert_eq!(out, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn tag_over_100_chars_is_truncated_not_rejected() {
        let long = "x".repeat(150);
        let out = normalize_tags(vec![long]).unwrap();
        assert_eq!(out[0].chars().count(), MAX_TAG_LEN);
    }

    #[test]
    fn fifty_one_tags_is_rejected() {
        let tags: Vec<String> = (0..51).map(|i| format!("tag{i}")).collect();
        assert!(normalize_tags(tags).is_err());
    }

    #[test]
    fn trailing_z_timestamp_is_accepted() {
        assert!(parse_rfc3339_strict("2024-01-01T00:00:00Z").is_ok());
    }

    #[test]
    fn naive_timestamp_is_rejected() {
        assert!(parse_rfc3339_strict("2024-01-01T00:00:00").is_err());
    }
}
