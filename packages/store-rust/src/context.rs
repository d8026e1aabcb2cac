//! Process-wide store facade with a teardown lifecycle.
//!
//! [`StoreContext`] owns the read cache, the debounce coordinator and the
//! observer registry for one gateway, and exposes the API call sites use.
//! State machine: Running -> Draining -> Closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use pzmm_core::{StoreGateway, StoreValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{StoreCache, WriteHandle};
use crate::config::StoreConfig;
use crate::debounce::DebouncedWriter;
use crate::error::StoreError;
use crate::observer::{ObserverId, ObserverRegistry, StoreObserver};

/// Lifecycle of a [`StoreContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting reads and writes with normal delays.
    Running,
    /// Teardown in progress; debounced writes skip their delay.
    Draining,
    /// Teardown finished.
    Closed,
}

/// Store facade shared by every call site in the process.
#[derive(Clone)]
pub struct StoreContext {
    config: StoreConfig,
    cache: StoreCache,
    debounced: DebouncedWriter,
    observers: Arc<ObserverRegistry>,
    lifecycle: Arc<ArcSwap<Lifecycle>>,
}

impl StoreContext {
    #[must_use]
    pub fn new(gateway: Arc<dyn StoreGateway>, config: StoreConfig) -> Self {
        let observers = Arc::new(ObserverRegistry::new());
        let cache = StoreCache::with_observers(gateway, config.clone(), Arc::clone(&observers));
        Self {
            debounced: DebouncedWriter::new(cache.clone()),
            config,
            cache,
            observers,
            lifecycle: Arc::new(ArcSwap::from_pointee(Lifecycle::Running)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &StoreCache {
        &self.cache
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        **self.lifecycle.load()
    }

    /// Reads `key` as `T`. See [`StoreCache::get`].
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.cache.get(key).await
    }

    pub async fn get_value(&self, key: &str) -> Option<StoreValue> {
        self.cache.get_value(key).await
    }

    /// Reads several keys in one round-trip. See [`StoreCache::get_many`].
    pub async fn get_many<I, S>(&self, keys: I) -> HashMap<String, Option<StoreValue>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.cache.get_many(keys).await
    }

    pub async fn has(&self, key: &str) -> bool {
        self.cache.has(key).await
    }

    /// # Errors
    ///
    /// Returns [`StoreError::Gateway`] if the gateway cannot list its keys.
    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.cache.keys().await
    }

    /// Writes `value` under `key` through the coalescing queue.
    ///
    /// Supersedes a debounced write to `key` that has not fired yet.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> WriteHandle {
        self.debounced.cancel(key);
        self.cache.set(key, value)
    }

    pub fn set_value(&self, key: &str, value: StoreValue) -> WriteHandle {
        self.debounced.cancel(key);
        self.cache.set_value(key, value)
    }

    /// Writes `value` under `key` once `delay` passes without another write
    /// to the same key.
    ///
    /// During teardown the delay is skipped and the value goes straight to
    /// the coalescing queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialize`] if `value` cannot be represented as JSON.
    pub fn set_debounced<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(value)?;
        if self.lifecycle() == Lifecycle::Running {
            self.debounced.set_value_debounced(key, value, delay);
        } else {
            // Handle dropped: the write still joins the next round.
            let _ = self.set_value(key, value);
        }
        Ok(())
    }

    /// Drops pending debounced writes, then clears the cache and gateway.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Gateway`] if the gateway fails to clear.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        self.debounced.clear();
        self.cache.clear_all().await
    }

    /// Registers an observer for store events.
    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) -> ObserverId {
        self.observers.add(observer)
    }

    /// Returns `true` if the observer was registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    /// Drains every pending write, bypassing delays, and saves the store.
    ///
    /// Best effort: gives up after `teardown_timeout`. Returns `true` if the
    /// drain finished in time; the context is `Closed` either way.
    pub async fn shutdown(&self) -> bool {
        self.lifecycle.store(Arc::new(Lifecycle::Draining));
        let drain = async {
            let debounced = self.debounced.flush_all().await;
            let queued = self.cache.flush_all().await;
            let saved = self.cache.save_pending().await;
            debounced.and(queued).and(saved)
        };
        let finished = match tokio::time::timeout(self.config.teardown_timeout, drain).await {
            Ok(Ok(())) => {
                info!("store drained");
                true
            }
            Ok(Err(err)) => {
                warn!(error = %err, "store drained with failed writes");
                true
            }
            Err(_) => {
                warn!(
                    timeout = ?self.config.teardown_timeout,
                    "store drain timed out; pending writes may be lost"
                );
                false
            }
        };
        self.lifecycle.store(Arc::new(Lifecycle::Closed));
        finished
    }
}
