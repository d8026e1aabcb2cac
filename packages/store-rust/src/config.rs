//! Configuration for the store cache and its timers.

use std::time::Duration;

/// File name of the store inside the application config directory.
pub const DEFAULT_STORE_FILE_NAME: &str = "pz_mod_manager.store.json";

/// Top-level configuration for a [`StoreContext`](crate::StoreContext).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Delay between the first pending write and the flush round that sends it.
    pub flush_delay: Duration,
    /// Debounce window for asking the gateway to flush its file to disk.
    pub save_delay: Duration,
    /// Upper bound on how long shutdown waits for pending writes to drain.
    pub teardown_timeout: Duration,
    /// Store file name used by file-backed gateways.
    pub store_file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(50),
            save_delay: Duration::from_millis(500),
            teardown_timeout: Duration::from_secs(2),
            store_file_name: DEFAULT_STORE_FILE_NAME.to_string(),
        }
    }
}
