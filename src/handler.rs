use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::{ConsumeOutcome, PulledMessage, QueueHandle};

/// Per-invocation context handed to message handlers.
#[derive(Clone, Debug)]
pub struct ConsumeContext {
    /// The queue from which the batch was pulled.
    pub queue: QueueHandle,
    /// Concurrent mode only: when set on a `Success` outcome, only messages `0..=ack_index` of
    /// the batch are treated as consumed, the rest are redelivered.
    pub ack_index: Option<usize>,
    /// Ordered mode only: overrides the configured queue suspension interval for the suspension
    /// caused by this invocation.
    pub suspend_override: Option<Duration>,
}

impl ConsumeContext {
    /// Create a new instance for the given queue.
    pub fn new(queue: QueueHandle) -> Self {
        Self {
            queue,
            ack_index: None,
            suspend_override: None,
        }
    }
}

/// A type capable of handling batches of messages in any order and in parallel.
#[async_trait]
pub trait ConcurrentHandler: Send + Sync + 'static {
    /// Handle a batch of messages.
    ///
    /// Returning `Result::Err` is treated as `ConsumeOutcome::RetryLater`, as is a panic.
    async fn consume(&self, msgs: &[PulledMessage], ctx: &mut ConsumeContext) -> Result<ConsumeOutcome>;
}

/// A type capable of handling batches of messages one queue at a time, in offset order.
#[async_trait]
pub trait OrderlyHandler: Send + Sync + 'static {
    /// Handle a batch of messages from a single queue.
    ///
    /// Returning `Result::Err` or panicking suspends the queue and redelivers the batch.
    async fn consume(&self, msgs: &[PulledMessage], ctx: &mut ConsumeContext) -> Result<ConsumeOutcome>;
}

/// The message listener registered with a consumer, which also selects the consumption mode.
#[derive(Clone)]
pub enum MessageListener {
    /// Messages are handled in parallel with no ordering guarantees.
    Concurrent(Arc<dyn ConcurrentHandler>),
    /// Messages of each queue are handled serially in offset order.
    Orderly(Arc<dyn OrderlyHandler>),
}

impl MessageListener {
    /// The name of this listener's consumption mode.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Concurrent(_) => "concurrent",
            Self::Orderly(_) => "orderly",
        }
    }
}

impl std::fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MessageListener").field(&self.mode()).finish()
    }
}

/// A destination for messages which have exhausted their retries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Accept a message which will not be redelivered.
    async fn dead_letter(&self, msg: &PulledMessage, reason: &str) -> Result<()>;
}

/// A dead-letter sink which only logs the disposition.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn dead_letter(&self, msg: &PulledMessage, reason: &str) -> Result<()> {
        tracing::error!(
            queue = %msg.queue,
            offset = msg.offset,
            reconsume_count = msg.reconsume_count,
            reason,
            "message dead-lettered"
        );
        Ok(())
    }
}
