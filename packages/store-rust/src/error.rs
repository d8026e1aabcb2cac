//! Error type surfaced to callers awaiting a store operation.

use std::sync::Arc;

/// Errors returned to the caller of a store write or clear.
///
/// `Clone` because one failed flush round is delivered to every caller whose
/// write was part of it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store gateway error: {0}")]
    Gateway(Arc<anyhow::Error>),
    #[error("value could not be serialized: {0}")]
    Serialize(Arc<serde_json::Error>),
    #[error("pending write discarded by clear")]
    Cleared,
    #[error("write completion was abandoned before the flush finished")]
    Abandoned,
}

impl StoreError {
    pub(crate) fn gateway(err: anyhow::Error) -> Self {
        Self::Gateway(Arc::new(err))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(Arc::new(err))
    }
}
