//! Gateway test double shared by the cache, debounce, and context tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pzmm_core::{StoreGateway, StoreValue};

/// In-memory gateway that records every call and can inject latency and failures.
///
/// Tracks how many `set` calls overlap so tests can assert that flush rounds
/// never run concurrently.
pub(crate) struct RecordingGateway {
    entries: Mutex<HashMap<String, StoreValue>>,
    gets: Mutex<Vec<String>>,
    batches: Mutex<Vec<Vec<String>>>,
    sets: Mutex<Vec<(String, StoreValue)>>,
    saves: AtomicUsize,
    clears: AtomicUsize,
    active_sets: AtomicUsize,
    max_active_sets: AtomicUsize,
    get_delay: Mutex<Duration>,
    set_delay: Mutex<Duration>,
    failing_keys: Mutex<HashSet<String>>,
    fail_gets: AtomicBool,
    fail_saves: AtomicBool,
    batch_supported: AtomicBool,
    available: AtomicBool,
}

impl RecordingGateway {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            gets: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            sets: Mutex::new(Vec::new()),
            saves: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            active_sets: AtomicUsize::new(0),
            max_active_sets: AtomicUsize::new(0),
            get_delay: Mutex::new(Duration::ZERO),
            set_delay: Mutex::new(Duration::ZERO),
            failing_keys: Mutex::new(HashSet::new()),
            fail_gets: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
            batch_supported: AtomicBool::new(true),
            available: AtomicBool::new(true),
        }
    }

    pub(crate) fn with_entry(self, key: &str, value: StoreValue) -> Self {
        self.entries.lock().insert(key.to_string(), value);
        self
    }

    pub(crate) fn with_get_delay(self, delay: Duration) -> Self {
        *self.get_delay.lock() = delay;
        self
    }

    pub(crate) fn with_set_delay(self, delay: Duration) -> Self {
        *self.set_delay.lock() = delay;
        self
    }

    pub(crate) fn without_batch_support(self) -> Self {
        self.batch_supported.store(false, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_key(&self, key: &str) {
        self.failing_keys.lock().insert(key.to_string());
    }

    pub(crate) fn heal_key(&self, key: &str) {
        self.failing_keys.lock().remove(key);
    }

    pub(crate) fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub(crate) fn get_count(&self, key: &str) -> usize {
        self.gets.lock().iter().filter(|k| *k == key).count()
    }

    pub(crate) fn total_gets(&self) -> usize {
        self.gets.lock().len()
    }

    pub(crate) fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    pub(crate) fn sets(&self) -> Vec<(String, StoreValue)> {
        self.sets.lock().clone()
    }

    pub(crate) fn set_count(&self, key: &str) -> usize {
        self.sets.lock().iter().filter(|(k, _)| k == key).count()
    }

    pub(crate) fn stored(&self, key: &str) -> Option<StoreValue> {
        self.entries.lock().get(key).cloned()
    }

    pub(crate) fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_sets(&self) -> usize {
        self.max_active_sets.load(Ordering::SeqCst)
    }

    fn lookup(&self, key: &str) -> Option<StoreValue> {
        self.entries.lock().get(key).cloned()
    }
}

#[async_trait]
impl StoreGateway for RecordingGateway {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<StoreValue>> {
        self.gets.lock().push(key.to_string());
        let delay = *self.get_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_gets.load(Ordering::SeqCst) {
            anyhow::bail!("injected read failure for {key}");
        }
        Ok(self.lookup(key))
    }

    async fn get_batch(
        &self,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, Option<StoreValue>>> {
        if !self.batch_supported.load(Ordering::SeqCst) {
            anyhow::bail!("batch reads not supported");
        }
        self.batches.lock().push(keys.to_vec());
        let delay = *self.get_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_gets.load(Ordering::SeqCst) {
            anyhow::bail!("injected batch read failure");
        }
        Ok(keys
            .iter()
            .filter_map(|key| self.lookup(key).map(|value| (key.clone(), Some(value))))
            .collect())
    }

    async fn set(&self, key: &str, value: &StoreValue) -> anyhow::Result<()> {
        let active = self.active_sets.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_sets.fetch_max(active, Ordering::SeqCst);
        self.sets.lock().push((key.to_string(), value.clone()));

        let delay = *self.set_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failed = self.failing_keys.lock().contains(key);
        if !failed {
            self.entries.lock().insert(key.to_string(), value.clone());
        }
        self.active_sets.fetch_sub(1, Ordering::SeqCst);
        if failed {
            anyhow::bail!("injected write failure for {key}");
        }
        Ok(())
    }

    async fn save(&self) -> anyhow::Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("injected save failure");
        }
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().clear();
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
