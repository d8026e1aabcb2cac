//! pzmm core — store value types, value signatures, and the remote store gateway trait.

pub mod gateway;
pub mod signature;
pub mod types;

pub use gateway::StoreGateway;
pub use signature::Signature;
pub use types::{is_present, normalize_keys, StoreValue};
