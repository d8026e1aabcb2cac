//! pzmm store — read cache, write coalescing and debounced persistence over
//! a key-value store gateway.
//!
//! [`StoreContext`] is the entry point: build one per process around a
//! [`StoreGateway`](pzmm_core::StoreGateway) and share it.

pub mod cache;
pub mod config;
pub mod context;
pub mod debounce;
pub mod error;
pub mod gateways;
pub mod observer;
pub mod save;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use cache::{StoreCache, WriteHandle};
pub use config::{StoreConfig, DEFAULT_STORE_FILE_NAME};
pub use context::{Lifecycle, StoreContext};
pub use debounce::DebouncedWriter;
pub use error::StoreError;
pub use gateways::{GatewayStats, JsonFileGateway, MemoryGateway, NullGateway};
pub use observer::{ObserverId, ObserverRegistry, StoreObserver};
pub use telemetry::init_tracing;
