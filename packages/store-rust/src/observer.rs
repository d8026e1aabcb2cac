//! Store observers and the registry that fans notifications out to them.
//!
//! Defines [`StoreObserver`] for reacting to cache changes and
//! [`ObserverRegistry`], an explicit observer list with add/remove by id.
//! Events are queued while the cache holds the lock that orders the update,
//! and delivered from that queue after the lock is released. Delivery is
//! therefore in update order across threads, and observers may call back into
//! the cache or unsubscribe themselves. Events raised from inside an observer
//! are delivered after the current one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use pzmm_core::StoreValue;

/// Observer for changes flowing through the store cache.
///
/// All methods default to no-ops so observers implement only what they need.
/// Used as `Arc<dyn StoreObserver>`.
pub trait StoreObserver: Send + Sync {
    /// Called after a write updated the cache (before it is flushed).
    fn on_write(&self, _key: &str, _value: &StoreValue) {}

    /// Called after a value was read from the gateway into the cache.
    fn on_load(&self, _key: &str, _value: Option<&StoreValue>) {}

    /// Called after a flush round for `keys` completed.
    fn on_flush(&self, _keys: &[String], _succeeded: bool) {}

    /// Called after the cache and the gateway were cleared.
    fn on_clear(&self) {}
}

/// Handle returned by [`ObserverRegistry::add`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// A change waiting to be delivered to observers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoreEvent {
    Write { key: String, value: StoreValue },
    Load { key: String, value: Option<StoreValue> },
    Flush { keys: Vec<String>, succeeded: bool },
    Clear,
}

/// Ordered list of observers with explicit add/remove.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Arc<dyn StoreObserver>)>>,
    queue: Mutex<VecDeque<StoreEvent>>,
    delivering: AtomicBool,
}

/// Releases the delivery slot even if an observer panics.
struct DeliveryGuard<'a>(&'a AtomicBool);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ObserverRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. Notifications reach observers in registration order.
    pub fn add(&self, observer: Arc<dyn StoreObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Unregisters an observer. Returns `false` if the id was unknown.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether no observers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    // Snapshot so callbacks run without the list lock held.
    fn snapshot(&self) -> Vec<Arc<dyn StoreObserver>> {
        self.observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    /// Queues `event`. Call while holding the lock that orders the update.
    ///
    /// Dropped when nobody is subscribed.
    pub(crate) fn push(&self, event: StoreEvent) {
        if self.is_empty() {
            return;
        }
        self.queue.lock().push_back(event);
    }

    /// Delivers queued events in push order.
    ///
    /// Returns immediately if another caller is delivering; that caller
    /// drains the events queued here as well.
    pub(crate) fn deliver(&self) {
        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }
            {
                let _slot = DeliveryGuard(&self.delivering);
                loop {
                    let Some(event) = self.queue.lock().pop_front() else {
                        break;
                    };
                    self.dispatch(&event);
                }
            }
            // An event may have been queued after the last pop but before the slot was released.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn dispatch(&self, event: &StoreEvent) {
        for observer in self.snapshot() {
            match event {
                StoreEvent::Write { key, value } => observer.on_write(key, value),
                StoreEvent::Load { key, value } => observer.on_load(key, value.as_ref()),
                StoreEvent::Flush { keys, succeeded } => observer.on_flush(keys, *succeeded),
                StoreEvent::Clear => observer.on_clear(),
            }
        }
    }
}
