//! Per-key debounced writes with caller-chosen delays.
//!
//! Each key waits for its own quiet period; a later write to the same key
//! replaces the value and restarts that key's window. One timer targets the
//! earliest due time across all keys. When it fires, only the keys that are
//! due are handed to the [`StoreCache`], and the timer is re-armed for the
//! next earliest key. Whether a value is unchanged is decided by the cache's
//! persisted signatures, so writes made directly through the cache count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use pzmm_core::StoreValue;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{StoreCache, WriteHandle};
use crate::error::StoreError;

struct DebouncedEntry {
    value: StoreValue,
    due_at: Instant,
}

#[derive(Default)]
struct DebounceState {
    pending: HashMap<String, DebouncedEntry>,
    /// Target instant and task of the armed timer.
    timer: Option<(Instant, JoinHandle<()>)>,
}

struct DebounceInner {
    cache: StoreCache,
    state: Mutex<DebounceState>,
}

/// Debounce coordinator layered over a [`StoreCache`].
///
/// A debounced value is visible to reads at once; only the gateway write
/// waits for the quiet period.
#[derive(Clone)]
pub struct DebouncedWriter {
    inner: Arc<DebounceInner>,
}

impl DebouncedWriter {
    #[must_use]
    pub fn new(cache: StoreCache) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                cache,
                state: Mutex::new(DebounceState::default()),
            }),
        }
    }

    /// Serializes `value` and schedules it for `key` after `delay` of quiet.
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
        self.set_value_debounced(key, value, delay);
        Ok(())
    }

    /// Schedules `value` for `key` once `delay` passes without another write
    /// to the same key.
    ///
    /// The cache reflects `value` immediately. A value equal to the one the
    /// cache knows is persisted, with nothing queued or in flight for the
    /// key, cancels any pending write for the key instead of scheduling one.
    pub fn set_value_debounced(&self, key: &str, value: StoreValue, delay: Duration) {
        {
            let mut state = self.inner.state.lock();
            if self.inner.cache.stage(key, &value) {
                if state.pending.remove(key).is_some() {
                    debug!(key, "debounced write reverted to persisted value");
                }
            } else {
                state.pending.insert(
                    key.to_string(),
                    DebouncedEntry {
                        value,
                        due_at: Instant::now() + delay,
                    },
                );
                debug!(key, ?delay, "debounced write scheduled");
                self.inner.rearm(&mut state);
            }
        }
        self.inner.cache.deliver_events();
    }

    /// Drops the pending write for `key`, if any. Returns whether one existed.
    ///
    /// Called when a direct write to `key` supersedes the deferred one.
    pub fn cancel(&self, key: &str) -> bool {
        self.inner.state.lock().pending.remove(key).is_some()
    }

    /// Hands every pending key to the cache immediately and flushes it.
    ///
    /// # Errors
    ///
    /// Returns the error of the last failed flush round, if any.
    pub async fn flush_all(&self) -> Result<(), StoreError> {
        let entries: Vec<(String, DebouncedEntry)> = {
            let mut state = self.inner.state.lock();
            if let Some((_, timer)) = state.timer.take() {
                timer.abort();
            }
            state.pending.drain().collect()
        };
        if !entries.is_empty() {
            debug!(keys = entries.len(), "flushing debounced writes");
        }
        let handles = self.inner.submit(entries);
        let flushed = self.inner.cache.flush_all().await;
        settle(handles).await;
        flushed
    }

    /// Drops every pending write.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
        state.pending.clear();
    }

    /// Number of keys waiting for their quiet period.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl DebounceInner {
    /// Points the timer at the earliest due key, or disarms it.
    fn rearm(self: &Arc<Self>, state: &mut DebounceState) {
        let Some(earliest) = state.pending.values().map(|entry| entry.due_at).min() else {
            if let Some((_, timer)) = state.timer.take() {
                timer.abort();
            }
            return;
        };
        if let Some((target, _)) = &state.timer {
            if *target <= earliest {
                return;
            }
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available; debounced writes wait for flush_all");
            return;
        };
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
        let inner = Arc::clone(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep_until(earliest).await;
            inner.fire().await;
        });
        state.timer = Some((earliest, task));
    }

    async fn fire(self: Arc<Self>) {
        let due: Vec<(String, DebouncedEntry)> = {
            let mut state = self.state.lock();
            state.timer = None;
            let now = Instant::now();
            let keys: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, entry)| entry.due_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            let due = keys
                .iter()
                .filter_map(|key| state.pending.remove_entry(key))
                .collect();
            self.rearm(&mut state);
            due
        };
        settle(self.submit(due)).await;
    }

    /// Queues `entries` in the cache, which skips values already persisted.
    fn submit(&self, entries: Vec<(String, DebouncedEntry)>) -> Vec<(String, WriteHandle)> {
        entries
            .into_iter()
            .map(|(key, entry)| {
                let handle = self.cache.set_value(&key, entry.value);
                (key, handle)
            })
            .collect()
    }
}

async fn settle(handles: Vec<(String, WriteHandle)>) {
    let outcomes = join_all(
        handles
            .into_iter()
            .map(|(key, handle)| async move { (key, handle.await) }),
    )
    .await;
    for (key, outcome) in outcomes {
        if let Err(err) = outcome {
            warn!(key = key.as_str(), error = %err, "debounced write failed");
        }
    }
}
