//! Opaque cursor pagination kernel (spec §4.1).
//!
//! Callers do not run a `LIMIT n+1` query directly; they give the kernel the
//! already-fetched `limit+1` rows (or fewer) plus a cursor-value extractor,
//! and it produces `{data, next_cursor, has_more}` uniformly.

use crate::error::ApiError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const MAX_PAGE_SIZE: u32 = 200;
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Clamp a caller-supplied page size into `[1, MAX_PAGE_SIZE]`.
pub fn clamp_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// The decoded contents of an opaque cursor. Exactly one of the three should
/// be populated by a given pagination kernel instance, but all three are
/// carried so cursors stay forward-compatible across order-column choices.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CursorValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl CursorValue {
    pub fn from_value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// First non-empty of `value, id, created_at`, per spec §4.1.
    pub fn chosen(&self) -> Option<&str> {
        self.value
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.id.as_deref().filter(|s| !s.is_empty()))
            .or_else(|| self.created_at.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Encode a cursor value as an opaque base64url(JSON) string.
pub fn encode_cursor(value: &CursorValue) -> String {
    let json = serde_json::to_vec(value).expect("CursorValue always serializes");
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode an opaque cursor string back into its structured form.
/// An invalid cursor is surfaced as `invalid_cursor`, never silently reset.
pub fn decode_cursor(raw: &str) -> Result<CursorValue, ApiError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.as_bytes())
        .map_err(|_| ApiError::invalid_cursor())?;
    serde_json::from_slice(&bytes).map_err(|_| ApiError::invalid_cursor())
}

/// A single page of results.
#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub data: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Build a page from up to `limit + 1` rows fetched in ascending order.
///
/// `rows` must contain at most `limit + 1` items (the pagination kernel's
/// `limit+1` probe). `cursor_of` extracts the ordering-column value used to
/// build the next cursor. `data` is always a (possibly empty) list, never
/// null, matching §4.1.
pub fn build_page<T, F>(mut rows: Vec<T>, limit: u32, cursor_of: F) -> Page<T>
where
    T: Serialize,
    F: Fn(&T) -> CursorValue,
{
    let limit = limit as usize;
    let has_more = rows.len() > limit;
    if has_more {
        rows.truncate(limit);
    }
    let next_cursor = rows.last().map(|last| encode_cursor(&cursor_of(last)));
    Page {
        data: rows,
        next_cursor,
        has_more,
    }
}

/// Helper for handlers: parse an optional cursor query parameter into the
/// chosen scalar string used as a `WHERE col > ?` bound, or `None` for the
/// first page.
pub fn cursor_bound(raw: Option<&str>) -> Result<Option<String>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => {
            let decoded = decode_cursor(s)?;
            Ok(decoded.chosen().map(str::to_string))
        }
    }
}

/// Round-trip a typed cursor payload (used when the order column is numeric,
/// e.g. `server_seq`, and the caller wants it back as a typed value instead
/// of a string).
pub fn decode_cursor_as<T: DeserializeOwned>(raw: &str) -> Result<T, ApiError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.as_bytes())
        .map_err(|_| ApiError::invalid_cursor())?;
    serde_json::from_slice(&bytes).map_err(|_| ApiError::invalid_cursor())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_limit_applies_default_and_bounds() {
        assert_eq!(clamp_limit(None), DEFAULT_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(75)), 75);
    }

    #[test]
    fn cursor_round_trips() {
        let cv = CursorValue::from_id("p_123");
        let encoded = encode_cursor(&cv);
        let decoded = decode_cursor(&encoded).unwrap();
        assert_eq!(decoded.chosen(), Some("p_123"));
    }

    #[test]
    fn invalid_cursor_is_rejected_not_reset() {
        let err = decode_cursor("not-valid-base64!!!").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidCursor);
    }

    #[test]
    fn build_page_sets_has_more_on_probe_overflow() {
        let rows = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let page = build_page(rows, 2, |r| CursorValue::from_value(r.clone()));
        assert_eq!(page.data, vec!["a".to_string(), "b".to_string()]);
        assert!(page.has_more);
        assert!(page.next_cursor.is_some());
    }

    #[test]
    fn build_page_clears_has_more_when_exact() {
        let rows = vec!["a".to_string(), "b".to_string()];
        let page = build_page(rows, 2, |r| CursorValue::from_value(r.clone()));
        assert!(!page.has_more);
    }

    #[test]
    fn chosen_prefers_value_over_id_over_created_at() {
        let cv = CursorValue {
            value: Some("v".to_string()),
            id: Some("i".to_string()),
            created_at: Some("c".to_string()),
        };
        assert_eq!(cv.chosen(), Some("v"));
    }
}
