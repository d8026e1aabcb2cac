//! Remote store gateway trait.
//!
//! Defines [`StoreGateway`], the asynchronous key-value persistence service
//! the cache sits in front of. Every call is a round-trip that may fail, be
//! slow, or find the backend unreachable. The gateway owns the durable medium;
//! `set` only changes its in-memory state until `save` flushes it.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::types::{is_present, StoreValue};

/// Asynchronous key-value persistence backend.
///
/// Used as `Arc<dyn StoreGateway>`.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    /// Short backend name for logs and metrics (e.g. `"memory"`, `"json-file"`).
    fn name(&self) -> &'static str;

    /// Whether a persistence backend is reachable at all.
    ///
    /// When this returns `false` the cache degrades to "always absent" reads
    /// and silently dropped writes instead of failing every call site.
    fn is_available(&self) -> bool {
        true
    }

    /// Load a single value. Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> anyhow::Result<Option<StoreValue>>;

    /// Load several values in one round-trip.
    ///
    /// Keys missing from the returned map are treated as absent. Backends
    /// without batch support keep the default, which fails so the caller falls
    /// back to per-key reads.
    async fn get_batch(
        &self,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, Option<StoreValue>>> {
        anyhow::bail!(
            "{} gateway does not support batch reads ({} keys requested)",
            self.name(),
            keys.len()
        )
    }

    /// Check whether a key holds a non-null value.
    async fn has(&self, key: &str) -> anyhow::Result<bool> {
        Ok(is_present(self.get(key).await?.as_ref()))
    }

    /// Store a value under `key` in the backend's in-memory state.
    async fn set(&self, key: &str, value: &StoreValue) -> anyhow::Result<()>;

    /// Flush the backend's state to its durable medium.
    async fn save(&self) -> anyhow::Result<()>;

    /// Remove every key.
    async fn clear(&self) -> anyhow::Result<()>;

    /// List every stored key.
    async fn keys(&self) -> anyhow::Result<Vec<String>>;
}
