//! [`StoreGateway`](pzmm_core::StoreGateway) implementations.
//!
//! - [`JsonFileGateway`]: the store file on disk.
//! - [`MemoryGateway`]: in-process map, for tests and ephemeral stores.
//! - [`NullGateway`]: an unreachable backend.

pub mod json_file;
pub mod memory;
pub mod null;

pub use json_file::JsonFileGateway;
pub use memory::{GatewayStats, MemoryGateway};
pub use null::NullGateway;
