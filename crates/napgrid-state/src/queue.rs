//! Per-function queue contract for pending asynchronous invocations.

use async_trait::async_trait;

use crate::error::StateResult;

#[async_trait]
pub trait FunctionQueue: Send + Sync {
    /// Append a payload to the tail of the function's queue.
    async fn enqueue(&self, function: &str, payload: &str) -> StateResult<()>;

    /// Pop up to `max` payloads from the head, oldest first.
    async fn dequeue_up_to(&self, function: &str, max: usize) -> StateResult<Vec<String>>;

    /// Number of payloads waiting.
    async fn count(&self, function: &str) -> StateResult<u64>;
}
