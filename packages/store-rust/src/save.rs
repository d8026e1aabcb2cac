//! Debounced durability saves.
//!
//! [`SaveScheduler`] turns bursts of successful gateway writes into a single
//! `save()` call. It is decoupled from the logical key-value writes: the
//! timer fires after the gateway's in-memory state already holds every write
//! that requested it, so no per-key tracking is needed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pzmm_core::StoreGateway;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Debounces durable flushes of the gateway's store file.
pub struct SaveScheduler {
    gateway: Arc<dyn StoreGateway>,
    delay: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SaveScheduler {
    /// Creates a scheduler that waits `delay` after the first request.
    #[must_use]
    pub fn new(gateway: Arc<dyn StoreGateway>, delay: Duration) -> Self {
        Self {
            gateway,
            delay,
            timer: Mutex::new(None),
        }
    }

    /// Requests a durable save. No-op if one is already scheduled.
    pub fn request(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("no async runtime available; durable save deferred to teardown");
            return;
        };
        let scheduler = Arc::clone(self);
        let delay = self.delay;
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Release the slot first so writes landing during the save schedule another.
            scheduler.timer.lock().take();
            let _ = scheduler.save().await;
        }));
        debug!(delay_ms = delay.as_millis(), "durable save scheduled");
    }

    /// Whether a save is waiting on its timer.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Cancels any scheduled save and saves immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Gateway`] if the gateway fails to save.
    pub async fn save_now(&self) -> Result<(), StoreError> {
        self.cancel();
        self.save().await
    }

    /// Saves immediately if a save was scheduled, skipping its remaining delay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Gateway`] if the gateway fails to save.
    pub async fn flush_pending(&self) -> Result<(), StoreError> {
        if self.cancel() {
            self.save().await
        } else {
            Ok(())
        }
    }

    fn cancel(&self) -> bool {
        match self.timer.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn save(&self) -> Result<(), StoreError> {
        metrics::counter!("pzmm_store_gateway_calls_total", "op" => "save").increment(1);
        match self.gateway.save().await {
            Ok(()) => {
                info!(gateway = self.gateway.name(), "store saved to disk");
                Ok(())
            }
            Err(err) => {
                warn!(gateway = self.gateway.name(), error = %err, "store save failed");
                Err(StoreError::gateway(err))
            }
        }
    }
}
