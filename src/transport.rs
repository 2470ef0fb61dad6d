use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::{PulledMessage, QueueHandle};

/// A client of the brokers hosting the consumed queues.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Long-poll the given queue for messages starting at `from_offset`.
    ///
    /// Implementations block for up to `max_wait` when no messages are available, returning an
    /// empty batch when the wait elapses. At most `max_batch` messages are returned, in offset
    /// order.
    async fn pull(&self, queue: &QueueHandle, from_offset: u64, max_batch: u32, max_wait: Duration) -> Result<Vec<PulledMessage>>;

    /// The next offset which the broker will write to the given queue.
    async fn max_offset(&self, queue: &QueueHandle) -> Result<u64>;
}
