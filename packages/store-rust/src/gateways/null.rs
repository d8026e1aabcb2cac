//! Gateway for a backend that cannot be reached.
//!
//! [`NullGateway`] reports itself unavailable, so the cache never calls it:
//! reads return absent and writes are dropped. Calls made directly succeed
//! without side effects.

use std::collections::HashMap;

use async_trait::async_trait;
use pzmm_core::{StoreGateway, StoreValue};

/// Stand-in used when no store backend could be opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGateway;

#[async_trait]
impl StoreGateway for NullGateway {
    fn name(&self) -> &'static str {
        "null"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> anyhow::Result<Option<StoreValue>> {
        Ok(None)
    }

    async fn get_batch(&self, _keys: &[String]) -> anyhow::Result<HashMap<String, Option<StoreValue>>> {
        Ok(HashMap::new())
    }

    async fn set(&self, _key: &str, _value: &StoreValue) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}
