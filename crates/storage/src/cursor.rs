//! Opaque pagination cursor: base64 of the JSON serialization of the store's
//! paging token, per spec.md §4.5/§8. Undecodable cursors are silently
//! treated as absent (fresh start from newest) — never a 4xx, since a stale
//! or tampered cursor must not break listing.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trace::TraceId;

/// The store's opaque "last evaluated key" for the `project-time-index`:
/// the sort key (`start_time`) plus the primary key (`trace_id`) as a
/// tie-breaker for traces sharing the same `start_time`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageToken {
    pub start_time: DateTime<Utc>,
    pub trace_id: TraceId,
}

/// URL-safe, unpadded alphabet — the cursor travels as a `?cursor=` query
/// value, where `+`/`/`/`=` from the standard alphabet would need escaping.
pub fn encode(token: &PageToken) -> String {
    let json = serde_json::to_vec(token).expect("PageToken is always serializable");
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
}

/// Decode a cursor; returns `None` on any malformed input rather than an
/// error, matching spec.md §4.5's "undecodable cursors are silently treated
/// as absent".
pub fn decode(cursor: &str) -> Option<PageToken> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn round_trips() {
        let token = PageToken {
            start_time: Utc::now(),
            trace_id: Uuid::now_v7(),
        };
        let encoded = encode(&token);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(token, decoded);
    }

    #[test]
    fn garbage_decodes_to_none() {
        assert!(decode("not-a-valid-cursor!!").is_none());
    }
}
