//! In-process [`StoreGateway`] backed by [`DashMap`].
//!
//! Nothing is written to disk; `save` only counts. Call statistics make it
//! useful for asserting how many round-trips a workload costs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use pzmm_core::{StoreGateway, StoreValue};

/// Snapshot of the calls a [`MemoryGateway`] has served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    pub gets: u64,
    pub batch_gets: u64,
    pub sets: u64,
    pub saves: u64,
    pub clears: u64,
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    batch_gets: AtomicU64,
    sets: AtomicU64,
    saves: AtomicU64,
    clears: AtomicU64,
}

/// Concurrent in-memory key-value store.
#[derive(Default)]
pub struct MemoryGateway {
    entries: DashMap<String, StoreValue>,
    counters: Counters,
}

impl MemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gateway pre-populated with `entries`.
    #[must_use]
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, StoreValue)>,
        K: Into<String>,
    {
        let gateway = Self::new();
        for (key, value) in entries {
            gateway.entries.insert(key.into(), value);
        }
        gateway
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        let c = &self.counters;
        GatewayStats {
            gets: c.gets.load(Ordering::Relaxed),
            batch_gets: c.batch_gets.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            saves: c.saves.load(Ordering::Relaxed),
            clears: c.clears.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl StoreGateway for MemoryGateway {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<StoreValue>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn get_batch(&self, keys: &[String]) -> anyhow::Result<HashMap<String, Option<StoreValue>>> {
        self.counters.batch_gets.fetch_add(1, Ordering::Relaxed);
        Ok(keys
            .iter()
            .map(|key| (key.clone(), self.entries.get(key).map(|entry| entry.value().clone())))
            .collect())
    }

    async fn set(&self, key: &str, value: &StoreValue) -> anyhow::Result<()> {
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn save(&self) -> anyhow::Result<()> {
        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.counters.clears.fetch_add(1, Ordering::Relaxed);
        self.entries.clear();
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_null())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
