//! Read cache and write-coalescing layer over a [`StoreGateway`].
//!
//! [`StoreCache`] hides gateway latency from call sites:
//!
//! - **Reads** ([`read`]): cache hits return immediately; concurrent misses
//!   for one key share a single round-trip.
//! - **Batch reads** ([`batch`]): one round-trip for every uncached key of a
//!   request, falling back to per-key reads.
//! - **Writes** ([`write`]): per-key pending writes (last value wins) flushed
//!   after a short delay, one flush round in flight at a time, followed by a
//!   debounced durable save.
//!
//! All mutable state sits behind one [`parking_lot::Mutex`] that is never
//! held across an `.await`. The flush round itself is serialized by a
//! separate async gate so a round can await the gateway while new writes
//! keep accumulating for the next round.

mod batch;
mod read;
mod write;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pzmm_core::{is_present, Signature, StoreGateway, StoreValue};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::observer::{ObserverRegistry, StoreEvent};
use crate::save::SaveScheduler;

pub use write::WriteHandle;

use read::SharedRead;
use write::PendingWrite;

/// Mutable cache state guarded by [`CacheInner::state`].
#[derive(Default)]
struct CacheState {
    /// Last-known value per key; `None` means known absent.
    entries: HashMap<String, Option<StoreValue>>,
    /// Signature of the value last known to be persisted, per key.
    persisted: HashMap<String, Signature>,
    /// Writes waiting for the next flush round.
    pending: HashMap<String, PendingWrite>,
    /// Keys whose write is part of the round currently in flight.
    flushing: HashSet<String>,
    /// One outstanding gateway read per key.
    reads: HashMap<String, SharedRead>,
    flush_scheduled: bool,
    /// Bumped by `clear`; reads started before a clear must not repopulate the cache.
    generation: u64,
}

impl CacheState {
    fn record_loaded(&mut self, key: &str, value: Option<StoreValue>) {
        self.persisted
            .insert(key.to_string(), Signature::of_optional(value.as_ref()));
        self.entries.insert(key.to_string(), value);
    }
}

struct CacheInner {
    config: StoreConfig,
    gateway: Arc<dyn StoreGateway>,
    state: Mutex<CacheState>,
    /// Held for the duration of a flush round.
    flight: tokio::sync::Mutex<()>,
    save: Arc<SaveScheduler>,
    observers: Arc<ObserverRegistry>,
    unavailable_logged: AtomicBool,
}

impl CacheInner {
    /// Checks the backend, logging the data-loss risk once when it is unreachable.
    fn available(&self) -> bool {
        if self.gateway.is_available() {
            return true;
        }
        if !self.unavailable_logged.swap(true, Ordering::Relaxed) {
            warn!(
                gateway = self.gateway.name(),
                "store backend unreachable: reads return absent and writes are dropped"
            );
        }
        false
    }
}

/// Process-wide cache in front of one store gateway.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct StoreCache {
    inner: Arc<CacheInner>,
}

impl StoreCache {
    /// Creates a cache with its own observer registry.
    #[must_use]
    pub fn new(gateway: Arc<dyn StoreGateway>, config: StoreConfig) -> Self {
        Self::with_observers(gateway, config, Arc::new(ObserverRegistry::new()))
    }

    /// Creates a cache that notifies the given observer registry.
    #[must_use]
    pub fn with_observers(
        gateway: Arc<dyn StoreGateway>,
        config: StoreConfig,
        observers: Arc<ObserverRegistry>,
    ) -> Self {
        let save = Arc::new(SaveScheduler::new(Arc::clone(&gateway), config.save_delay));
        Self {
            inner: Arc::new(CacheInner {
                config,
                gateway,
                state: Mutex::new(CacheState::default()),
                flight: tokio::sync::Mutex::new(()),
                save,
                observers,
                unavailable_logged: AtomicBool::new(false),
            }),
        }
    }

    /// The gateway this cache fronts.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn StoreGateway> {
        &self.inner.gateway
    }

    /// Reads `key` and deserializes it into `T`.
    ///
    /// Returns `None` if the key is absent or holds a value of another shape.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get_value(key).await?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(err) => {
                warn!(key, error = %err, "stored value has an unexpected shape");
                None
            }
        }
    }

    /// Whether `key` holds a non-null value.
    pub async fn has(&self, key: &str) -> bool {
        is_present(self.get_value(key).await.as_ref())
    }

    /// Every key with a non-null value, from the gateway plus unflushed writes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Gateway`] if the gateway cannot list its keys.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        if !self.inner.available() {
            return Ok(Vec::new());
        }
        let stored = self.inner.gateway.keys().await.map_err(StoreError::gateway)?;
        let state = self.inner.state.lock();
        let mut keys: Vec<String> = stored
            .into_iter()
            .filter(|key| !matches!(state.entries.get(key), Some(None | Some(StoreValue::Null))))
            .collect();
        keys.extend(
            state
                .entries
                .iter()
                .filter(|(_, value)| is_present(value.as_ref()))
                .map(|(key, _)| key.clone()),
        );
        drop(state);
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Drops every cached value and pending write, then clears the gateway.
    ///
    /// Waits for an in-flight flush round first so the clear is ordered after
    /// it. Pending writes that never reached the gateway resolve with
    /// [`StoreError::Cleared`]. Afterwards every key is unknown again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Gateway`] if the gateway fails to clear or save.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        if !self.inner.available() {
            return Ok(());
        }
        let _flight = self.inner.flight.lock().await;
        let discarded: Vec<PendingWrite> = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.entries.clear();
            state.persisted.clear();
            state.reads.clear();
            self.inner.observers.push(StoreEvent::Clear);
            state.pending.drain().map(|(_, write)| write).collect()
        };
        for write in discarded {
            write.resolve(&Err(StoreError::Cleared));
        }
        self.inner.observers.deliver();

        metrics::counter!("pzmm_store_gateway_calls_total", "op" => "clear").increment(1);
        self.inner
            .gateway
            .clear()
            .await
            .map_err(StoreError::gateway)?;
        self.inner.save.save_now().await?;
        info!(gateway = self.inner.gateway.name(), "store cleared");
        Ok(())
    }

    /// Saves immediately if a debounced durable save is waiting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Gateway`] if the gateway fails to save.
    pub async fn save_pending(&self) -> Result<(), StoreError> {
        self.inner.save.flush_pending().await
    }

    /// Number of writes waiting for a flush round.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether `key` has a cached value or known absence.
    #[must_use]
    pub fn is_cached(&self, key: &str) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }
}
