//! Distributed key-value store contract.
//!
//! Used for the leadership record, the published topology snapshot, and
//! cross-node activity timestamps. Writes must be safe to repeat.

use async_trait::async_trait;

use crate::error::StateResult;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StateResult<()>;
}
