//! Key and value types shared by the store gateway and the cache.

use std::collections::HashSet;

/// Payload stored under a key.
///
/// Any JSON-compatible value: scalars, records, or ordered sequences. The
/// backing store file is JSON, so `serde_json::Value` is the natural carrier.
/// Typed call sites convert through `serde_json::to_value` / `from_value`.
pub type StoreValue = serde_json::Value;

/// Normalizes a set of requested keys for batch operations.
///
/// Trims surrounding whitespace, drops keys that are empty after trimming,
/// and removes duplicates while preserving first-seen order.
///
/// # Examples
///
/// ```
/// use pzmm_core::types::normalize_keys;
///
/// let keys = normalize_keys(["a", " b ", "", "a", "  "]);
/// assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
/// ```
pub fn normalize_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for key in keys {
        let trimmed = key.as_ref().trim();
        if trimmed.is_empty() || !seen.insert(trimmed.to_string()) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// Returns `true` if a looked-up value counts as present.
///
/// The store plugin reports missing keys as either nothing or JSON `null`
/// depending on its version; both count as "not present".
#[must_use]
pub fn is_present(value: Option<&StoreValue>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}
