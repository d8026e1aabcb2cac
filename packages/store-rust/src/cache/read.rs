//! Single-key reads with in-flight deduplication.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use pzmm_core::StoreValue;
use tracing::{debug, warn};

use super::{CacheInner, StoreCache};
use crate::observer::StoreEvent;

/// A gateway read that any number of callers can await.
pub(super) type SharedRead = Shared<BoxFuture<'static, Option<StoreValue>>>;

impl StoreCache {
    /// Reads `key`, consulting the gateway only on a cache miss.
    ///
    /// Concurrent misses for the same key share one round-trip. Gateway
    /// errors read as absent and are not cached, so a later call retries.
    pub async fn get_value(&self, key: &str) -> Option<StoreValue> {
        if !self.inner.available() {
            return None;
        }
        let read = {
            let mut state = self.inner.state.lock();
            if let Some(value) = state.entries.get(key) {
                debug!(key, "cache hit");
                return value.clone();
            }
            let existing = state.reads.get(key).cloned();
            match existing {
                Some(read) => {
                    debug!(key, "joining in-flight read");
                    read
                }
                None => {
                    let read = fetch(Arc::clone(&self.inner), key.to_string(), state.generation)
                        .boxed()
                        .shared();
                    state.reads.insert(key.to_string(), read.clone());
                    read
                }
            }
        };
        read.await
    }
}

async fn fetch(inner: Arc<CacheInner>, key: String, generation: u64) -> Option<StoreValue> {
    metrics::counter!("pzmm_store_gateway_calls_total", "op" => "get").increment(1);
    let result = inner.gateway.get(&key).await;

    let mut state = inner.state.lock();
    let same_generation = state.generation == generation;
    if same_generation {
        state.reads.remove(&key);
    }
    match result {
        Ok(value) => {
            // A write that landed while the read was in flight is newer.
            if let Some(newer) = state.entries.get(&key) {
                return newer.clone();
            }
            if !same_generation {
                return value;
            }
            state.record_loaded(&key, value.clone());
            inner.observers.push(StoreEvent::Load {
                key: key.clone(),
                value: value.clone(),
            });
            drop(state);
            debug!(key, found = value.is_some(), "loaded from gateway");
            inner.observers.deliver();
            value
        }
        Err(err) => {
            warn!(key, error = %err, "store read failed, treating as absent");
            state.entries.get(&key).cloned().flatten()
        }
    }
}
