//! Batch bootstrap reads.

use std::collections::HashMap;

use futures_util::future::join_all;
use pzmm_core::{normalize_keys, StoreValue};
use tracing::{debug, warn};

use super::StoreCache;
use crate::observer::StoreEvent;

impl StoreCache {
    /// Reads several keys, fetching every uncached one in a single round-trip.
    ///
    /// Keys are trimmed and deduplicated; empty keys are ignored. The result
    /// holds an entry (value or `None`) for every remaining key. If the batch
    /// round-trip fails, or the gateway has no batch support, the missing
    /// keys are read individually instead.
    pub async fn get_many<I, S>(&self, keys: I) -> HashMap<String, Option<StoreValue>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = normalize_keys(keys);
        let mut result = HashMap::with_capacity(keys.len());
        if !self.inner.available() {
            result.extend(keys.into_iter().map(|key| (key, None)));
            return result;
        }

        let (missing, generation) = {
            let state = self.inner.state.lock();
            let mut missing = Vec::new();
            for key in keys {
                match state.entries.get(&key) {
                    Some(value) => {
                        result.insert(key, value.clone());
                    }
                    None => missing.push(key),
                }
            }
            (missing, state.generation)
        };
        if missing.is_empty() {
            return result;
        }

        debug!(
            cached = result.len(),
            missing = missing.len(),
            "batch read"
        );
        metrics::counter!("pzmm_store_gateway_calls_total", "op" => "get_batch").increment(1);
        match self.inner.gateway.get_batch(&missing).await {
            Ok(mut found) => {
                {
                    let mut state = self.inner.state.lock();
                    for key in missing {
                        let fetched = found.remove(&key).flatten();
                        let value = if let Some(newer) = state.entries.get(&key) {
                            newer.clone()
                        } else if state.generation == generation {
                            state.record_loaded(&key, fetched.clone());
                            self.inner.observers.push(StoreEvent::Load {
                                key: key.clone(),
                                value: fetched.clone(),
                            });
                            fetched
                        } else {
                            fetched
                        };
                        result.insert(key, value);
                    }
                }
                self.inner.observers.deliver();
            }
            Err(err) => {
                warn!(
                    keys = missing.len(),
                    error = %err,
                    "batch read failed, falling back to per-key reads"
                );
                let reads = missing.into_iter().map(|key| async move {
                    let value = self.get_value(&key).await;
                    (key, value)
                });
                result.extend(join_all(reads).await);
            }
        }
        result
    }
}
