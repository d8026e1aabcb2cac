//! Write coalescing queue and flush serializer.
//!
//! A write updates the read cache immediately and lands in a per-key pending
//! map, replacing any earlier unflushed value for the same key. The first
//! pending write schedules a flush round after `flush_delay`. A round takes
//! the whole pending map as its batch and sends one gateway `set` per entry
//! while holding the flight gate; writes arriving meanwhile schedule the next
//! round, which waits for the gate. Rounds therefore never overlap.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pzmm_core::{Signature, StoreValue};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{CacheInner, CacheState, StoreCache};
use crate::error::StoreError;
use crate::observer::StoreEvent;

type Completion = oneshot::Sender<Result<(), StoreError>>;

/// A write waiting for the next flush round.
pub(super) struct PendingWrite {
    value: StoreValue,
    signature: Signature,
    enqueued_at: Instant,
    waiters: Vec<Completion>,
}

impl PendingWrite {
    /// Delivers the round's outcome to every caller that wrote this key.
    pub(super) fn resolve(self, outcome: &Result<(), StoreError>) {
        for waiter in self.waiters {
            // Caller may have dropped its handle; the write still happened.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Completion signal for a [`StoreCache::set`] call.
///
/// Resolves once the flush round carrying the write has finished, not when
/// the store file is saved to disk. Dropping the handle does not cancel the
/// write.
#[derive(Debug)]
pub struct WriteHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Ready(Option<Result<(), StoreError>>),
    Waiting(oneshot::Receiver<Result<(), StoreError>>),
}

impl WriteHandle {
    fn ready(outcome: Result<(), StoreError>) -> Self {
        Self {
            state: HandleState::Ready(Some(outcome)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<(), StoreError>>) -> Self {
        Self {
            state: HandleState::Waiting(rx),
        }
    }

    /// Whether the write resolved without waiting for a flush round.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }
}

impl Future for WriteHandle {
    type Output = Result<(), StoreError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Ready(outcome) => Poll::Ready(outcome.take().unwrap_or(Ok(()))),
            HandleState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(StoreError::Abandoned))),
        }
    }
}

impl StoreCache {
    /// Serializes `value` and writes it under `key`.
    ///
    /// The cache reflects the new value as soon as this returns; the
    /// returned handle resolves when the value has been sent to the gateway.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> WriteHandle {
        match serde_json::to_value(value) {
            Ok(value) => self.set_value(key, value),
            Err(err) => WriteHandle::ready(Err(err.into())),
        }
    }

    /// Writes `value` under `key`.
    ///
    /// Writing the value last known to be persisted, with nothing pending or
    /// in flight for the key, resolves immediately without a round-trip.
    /// Otherwise the write replaces any pending value for the key and joins
    /// the next flush round.
    pub fn set_value(&self, key: &str, value: StoreValue) -> WriteHandle {
        if !self.inner.available() {
            debug!(key, "backend unreachable, write dropped");
            return WriteHandle::ready(Ok(()));
        }
        let signature = Signature::of(&value);

        let (handle, schedule) = {
            let mut state = self.inner.state.lock();
            state.entries.insert(key.to_string(), Some(value.clone()));
            self.inner.observers.push(StoreEvent::Write {
                key: key.to_string(),
                value: value.clone(),
            });
            enqueue(&mut state, key, value, signature)
        };

        self.inner.observers.deliver();
        if schedule {
            self.inner.schedule_flush();
        }
        handle
    }

    /// Makes `value` visible to reads of `key` without queueing a write.
    ///
    /// Used for writes deferred by the caller. Returns `true` if `value` is
    /// the persisted one and nothing is pending or in flight for the key, so
    /// the deferred write can be skipped. The observer event is queued; the
    /// caller delivers it with [`StoreCache::deliver_events`] once it holds
    /// no locks.
    pub(crate) fn stage(&self, key: &str, value: &StoreValue) -> bool {
        if !self.inner.available() {
            return true;
        }
        let signature = Signature::of(value);
        let unchanged = {
            let mut state = self.inner.state.lock();
            state.entries.insert(key.to_string(), Some(value.clone()));
            self.inner.observers.push(StoreEvent::Write {
                key: key.to_string(),
                value: value.clone(),
            });
            !state.pending.contains_key(key)
                && !state.flushing.contains(key)
                && state.persisted.get(key) == Some(&signature)
        };
        unchanged
    }

    pub(crate) fn deliver_events(&self) {
        self.inner.observers.deliver();
    }

    /// Sends every pending write now, bypassing the flush delay.
    ///
    /// Waits for an in-flight round first, then runs rounds until nothing is
    /// pending. Used at teardown.
    ///
    /// # Errors
    ///
    /// Returns the error of the last failed round, if any failed.
    pub async fn flush_all(&self) -> Result<(), StoreError> {
        let _flight = self.inner.flight.lock().await;
        let mut outcome = Ok(());
        loop {
            let batch = self.inner.take_batch();
            if batch.is_empty() {
                break;
            }
            if let Err(err) = self.inner.run_batch(batch).await {
                outcome = Err(err);
            }
        }
        outcome
    }
}

/// Records a write in the pending map. Returns the caller's handle and
/// whether a flush round needs scheduling.
fn enqueue(
    state: &mut CacheState,
    key: &str,
    value: StoreValue,
    signature: Signature,
) -> (WriteHandle, bool) {
    if let Some(pending) = state.pending.get_mut(key) {
        metrics::counter!("pzmm_store_writes_coalesced_total").increment(1);
        debug!(key, "coalesced with pending write");
        let (tx, rx) = oneshot::channel();
        pending.value = value;
        pending.signature = signature;
        pending.waiters.push(tx);
        return (WriteHandle::waiting(rx), false);
    }

    if !state.flushing.contains(key) && state.persisted.get(key) == Some(&signature) {
        metrics::counter!("pzmm_store_writes_suppressed_total").increment(1);
        debug!(key, "value unchanged, write suppressed");
        return (WriteHandle::ready(Ok(())), false);
    }

    let (tx, rx) = oneshot::channel();
    state.pending.insert(
        key.to_string(),
        PendingWrite {
            value,
            signature,
            enqueued_at: Instant::now(),
            waiters: vec![tx],
        },
    );
    let schedule = !state.flush_scheduled;
    state.flush_scheduled = true;
    (WriteHandle::waiting(rx), schedule)
}

impl CacheInner {
    /// Spawns the timer for the next flush round.
    fn schedule_flush(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available; writes stay queued until flush_all");
            self.state.lock().flush_scheduled = false;
            return;
        };
        let inner = Arc::clone(self);
        let delay = self.config.flush_delay;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Waits for an in-flight round; its writes were taken, ours were not.
            let _flight = inner.flight.lock().await;
            let batch = inner.take_batch();
            if !batch.is_empty() {
                let _ = inner.run_batch(batch).await;
            }
        });
    }

    /// Atomically moves every pending write into a new batch.
    ///
    /// Writes whose value has meanwhile become the persisted one resolve
    /// right away and are left out.
    fn take_batch(&self) -> Vec<(String, PendingWrite)> {
        let mut unchanged = Vec::new();
        let batch = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.flush_scheduled = false;
            let mut batch = Vec::with_capacity(state.pending.len());
            for (key, write) in state.pending.drain() {
                if state.persisted.get(&key) == Some(&write.signature) {
                    unchanged.push(write);
                } else {
                    state.flushing.insert(key.clone());
                    batch.push((key, write));
                }
            }
            batch
        };
        for write in unchanged {
            write.resolve(&Ok(()));
        }
        batch
    }

    /// Sends one batch to the gateway. Caller holds the flight gate.
    async fn run_batch(&self, batch: Vec<(String, PendingWrite)>) -> Result<(), StoreError> {
        let span = info_span!("flush", batch = batch.len());
        async move {
            let mut failure = None;
            let mut wrote_any = false;
            for (key, write) in &batch {
                metrics::counter!("pzmm_store_gateway_calls_total", "op" => "set").increment(1);
                match self.gateway.set(key, &write.value).await {
                    Ok(()) => wrote_any = true,
                    Err(err) => {
                        warn!(key = key.as_str(), error = %err, "store write failed");
                        failure.get_or_insert(err);
                    }
                }
            }
            if wrote_any {
                self.save.request();
            }

            let outcome = match failure {
                None => Ok(()),
                Some(err) => {
                    metrics::counter!("pzmm_store_flush_failures_total").increment(1);
                    Err(StoreError::gateway(err))
                }
            };
            let keys: Vec<String> = batch.iter().map(|(key, _)| key.clone()).collect();
            {
                let mut state = self.state.lock();
                for key in &keys {
                    state.flushing.remove(key);
                }
                for (key, write) in &batch {
                    if outcome.is_ok() {
                        state.persisted.insert(key.clone(), write.signature);
                    } else {
                        // Some keys of a failed round may have landed; none may be skipped as unchanged.
                        state.persisted.remove(key);
                    }
                }
                self.observers.push(StoreEvent::Flush {
                    keys: keys.clone(),
                    succeeded: outcome.is_ok(),
                });
            }

            let oldest = batch
                .iter()
                .map(|(_, write)| write.enqueued_at.elapsed())
                .max()
                .unwrap_or_default();
            info!(
                keys = keys.len(),
                succeeded = outcome.is_ok(),
                oldest_ms = u64::try_from(oldest.as_millis()).unwrap_or(u64::MAX),
                "flush round finished"
            );
            self.observers.deliver();
            for (_, write) in batch {
                write.resolve(&outcome);
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pzmm_core::StoreGateway;
    use serde_json::json;

    use crate::config::StoreConfig;
    use crate::observer::ObserverRegistry;
    use crate::test_support::RecordingGateway;

    use super::*;

    fn cache(gateway: &Arc<RecordingGateway>) -> StoreCache {
        StoreCache::new(
            Arc::clone(gateway) as Arc<dyn StoreGateway>,
            StoreConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn identical_writes_cost_one_round_trip() {
        let gateway = Arc::new(RecordingGateway::new());
        let cache = cache(&gateway);

        let first = cache.set_value("pz_mod_tags", json!(["qol", "map"]));
        let second = cache.set_value("pz_mod_tags", json!(["qol", "map"]));
        first.await.unwrap();
        second.await.unwrap();

        // Now persisted: a third identical write resolves without waiting.
        let third = cache.set_value("pz_mod_tags", json!(["qol", "map"]));
        assert!(third.is_ready());
        third.await.unwrap();

        assert_eq!(gateway.set_count("pz_mod_tags"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writing_the_loaded_value_is_a_no_op() {
        let gateway = Arc::new(RecordingGateway::new().with_entry("limit", json!(50)));
        let cache = cache(&gateway);

        assert_eq!(cache.get_value("limit").await, Some(json!(50)));
        let handle = cache.set("limit", &50);
        assert!(handle.is_ready());
        handle.await.unwrap();

        // Known absent + null is also unchanged.
        assert_eq!(cache.get_value("missing").await, None);
        assert!(cache.set_value("missing", StoreValue::Null).is_ready());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(gateway.sets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn last_value_wins_before_flush() {
        let gateway = Arc::new(RecordingGateway::new());
        let cache = cache(&gateway);

        let a = cache.set_value("filter", json!("A"));
        let b = cache.set_value("filter", json!("B"));
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(gateway.sets(), vec![("filter".to_string(), json!("B"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn reads_see_writes_before_the_flush() {
        let gateway = Arc::new(RecordingGateway::new().with_entry("folder", json!("/old")));
        let cache = cache(&gateway);

        let handle = cache.set_value("folder", json!("/new"));

        assert_eq!(cache.get_value("folder").await, Some(json!("/new")));
        assert!(gateway.sets().is_empty(), "flush timer has not fired yet");
        assert_eq!(gateway.get_count("folder"), 0);

        handle.await.unwrap();
        assert_eq!(gateway.stored("folder"), Some(json!("/new")));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_waits_for_the_delay() {
        let gateway = Arc::new(RecordingGateway::new());
        let cache = cache(&gateway);
        let started = Instant::now();

        cache.set_value("k", json!(1)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(gateway.set_count("k"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_rounds_never_overlap() {
        let gateway = Arc::new(RecordingGateway::new().with_set_delay(Duration::from_millis(40)));
        let cache = cache(&gateway);

        let a = cache.set_value("a", json!(1));
        // Round one starts at 50ms and holds the gate until 90ms.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let b = cache.set_value("b", json!(2));
        let c = cache.set_value("c", json!(3));
        // Rewriting a key that is in flight joins the next round.
        let a2 = cache.set_value("a", json!(10));

        for handle in [a, b, c, a2] {
            handle.await.unwrap();
        }

        assert_eq!(gateway.max_concurrent_sets(), 1);
        let sets = gateway.sets();
        assert_eq!(sets.len(), 4);
        assert_eq!(sets[0], ("a".to_string(), json!(1)));
        assert_eq!(gateway.stored("a"), Some(json!(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_round_rejects_only_its_own_callers() {
        let gateway = Arc::new(RecordingGateway::new().with_set_delay(Duration::from_millis(20)));
        gateway.fail_key("p");
        let cache = cache(&gateway);

        let p = cache.set_value("p", json!("p1"));
        let q = cache.set_value("q", json!("q1"));
        // Round {p, q} runs 50..90ms; r arrives mid-flight and rides the next round.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let r = cache.set_value("r", json!("r1"));

        assert!(matches!(p.await, Err(StoreError::Gateway(_))));
        assert!(matches!(q.await, Err(StoreError::Gateway(_))));
        r.await.unwrap();

        // Cache keeps the failed values.
        assert_eq!(cache.get_value("p").await, Some(json!("p1")));
        assert_eq!(cache.get_value("q").await, Some(json!("q1")));
    }

    #[tokio::test(start_paused = true)]
    async fn reverting_a_key_that_landed_in_a_failed_round_is_written() {
        let gateway = Arc::new(RecordingGateway::new().with_entry("q", json!("q0")));
        gateway.fail_key("p");
        let cache = cache(&gateway);
        assert_eq!(cache.get_value("q").await, Some(json!("q0")));

        let p = cache.set_value("p", json!("p1"));
        let q = cache.set_value("q", json!("q1"));
        assert!(p.await.is_err());
        assert!(q.await.is_err());
        // q's set reached the gateway even though the round was rejected.
        assert_eq!(gateway.stored("q"), Some(json!("q1")));

        let revert = cache.set_value("q", json!("q0"));
        assert!(!revert.is_ready(), "gateway holds q1, so q0 is a real change");
        revert.await.unwrap();

        assert_eq!(gateway.stored("q"), Some(json!("q0")));
        assert_eq!(cache.get_value("q").await, gateway.stored("q"));
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_writes_and_rounds_in_update_order() {
        use parking_lot::Mutex;

        use crate::observer::StoreObserver;

        #[derive(Default)]
        struct Log(Mutex<Vec<String>>);

        impl StoreObserver for Log {
            fn on_write(&self, key: &str, value: &StoreValue) {
                self.0.lock().push(format!("write {key}={value}"));
            }
            fn on_flush(&self, keys: &[String], succeeded: bool) {
                self.0.lock().push(format!("flush {keys:?} {succeeded}"));
            }
        }

        let gateway = Arc::new(RecordingGateway::new());
        let observers = Arc::new(ObserverRegistry::new());
        let log = Arc::new(Log::default());
        observers.add(Arc::clone(&log) as Arc<dyn StoreObserver>);
        let cache = StoreCache::with_observers(
            Arc::clone(&gateway) as Arc<dyn StoreGateway>,
            StoreConfig::default(),
            observers,
        );

        let first = cache.set_value("k", json!(1));
        let second = cache.set_value("k", json!(2));
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(
            *log.0.lock(),
            vec!["write k=1", "write k=2", "flush [\"k\"] true"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_value_is_retried_not_suppressed() {
        let gateway = Arc::new(RecordingGateway::new());
        gateway.fail_key("q");
        let cache = cache(&gateway);

        assert!(cache.set_value("q", json!(1)).await.is_err());
        gateway.heal_key("q");

        let retry = cache.set_value("q", json!(1));
        assert!(!retry.is_ready());
        retry.await.unwrap();

        assert_eq!(gateway.set_count("q"), 2);
        assert_eq!(gateway.stored("q"), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_writes_request_one_debounced_save() {
        let gateway = Arc::new(RecordingGateway::new());
        let cache = cache(&gateway);

        cache.set_value("a", json!(1)).await.unwrap();
        cache.set_value("b", json!(2)).await.unwrap();
        assert_eq!(gateway.save_count(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(gateway.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_skips_the_delay() {
        let gateway = Arc::new(RecordingGateway::new());
        let cache = cache(&gateway);
        let started = Instant::now();

        let handle = cache.set_value("k", json!("v"));
        cache.flush_all().await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(gateway.set_count("k"), 1);
        handle.await.unwrap();
        assert_eq!(cache.pending_writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reverting_to_the_persisted_value_before_flush_skips_the_round_trip() {
        let gateway = Arc::new(RecordingGateway::new().with_entry("mode", json!("grid")));
        let cache = cache(&gateway);
        assert_eq!(cache.get_value("mode").await, Some(json!("grid")));

        let changed = cache.set_value("mode", json!("list"));
        let reverted = cache.set_value("mode", json!("grid"));
        changed.await.unwrap();
        reverted.await.unwrap();

        assert!(gateway.sets().is_empty());
        assert_eq!(cache.get_value("mode").await, Some(json!("grid")));
    }

    #[tokio::test]
    async fn unserializable_value_is_rejected() {
        use std::collections::HashMap;

        let gateway = Arc::new(RecordingGateway::new());
        let cache = cache(&gateway);
        // Non-string map keys cannot become JSON object keys.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);

        let err = cache.set("bad", &bad).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialize(_)));
        assert!(!cache.is_cached("bad"));
    }

    #[tokio::test]
    async fn handle_reports_abandoned_when_the_round_is_lost() {
        let (tx, rx) = oneshot::channel::<Result<(), StoreError>>();
        drop(tx);
        let handle = WriteHandle::waiting(rx);
        assert!(matches!(handle.await, Err(StoreError::Abandoned)));
    }
}
