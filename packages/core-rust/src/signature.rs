//! Value signatures for no-op write detection.
//!
//! A [`Signature`] is a BLAKE3 digest of a value's canonical JSON form. The
//! cache keeps one per key for the last value known to be persisted, so a
//! write of an identical value can be answered without a round-trip.
//!
//! # Canonical form
//!
//! `serde_json::Value` objects are backed by a `BTreeMap` (the
//! `preserve_order` feature is not enabled in this workspace), so object keys
//! always serialize in sorted order and two structurally equal values produce
//! the same bytes regardless of how they were built.

use std::fmt;

use crate::types::StoreValue;

/// Comparable digest of a serialized value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature([u8; 32]);

impl Signature {
    /// Computes the signature of `value`.
    ///
    /// # Examples
    ///
    /// ```
    /// use pzmm_core::signature::Signature;
    /// use serde_json::json;
    ///
    /// let a = Signature::of(&json!({"limit": 50, "page": 2}));
    /// let b = Signature::of(&json!({"page": 2, "limit": 50}));
    /// assert_eq!(a, b);
    /// ```
    #[must_use]
    pub fn of(value: &StoreValue) -> Self {
        let canonical = value.to_string();
        Self(*blake3::hash(canonical.as_bytes()).as_bytes())
    }

    /// Signature of a key the store reports as missing.
    ///
    /// Missing keys read back as JSON `null`, so writing `null` to a key
    /// known to be absent is a no-op.
    #[must_use]
    pub fn absent() -> Self {
        Self::of(&StoreValue::Null)
    }

    /// Signature of an optional value, treating `None` as [`Signature::absent`].
    #[must_use]
    pub fn of_optional(value: Option<&StoreValue>) -> Self {
        value.map_or_else(Self::absent, Self::of)
    }

    /// Lowercase hex encoding of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 bytes are plenty to tell signatures apart in logs.
        write!(f, "Signature({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
