use std::sync::Arc;

use super::DispatchShared;
use crate::handler::{ConcurrentHandler, ConsumeContext};
use crate::message::{ConsumeOutcome, PulledMessage};
use crate::offset::SharedProgress;

/// Dispatches batches to a worker pool with no ordering guarantees.
pub struct ConcurrentDispatcher {
    handler: Arc<dyn ConcurrentHandler>,
    shared: Arc<DispatchShared>,
}

impl ConcurrentDispatcher {
    /// Create a new instance.
    pub fn new(handler: Arc<dyn ConcurrentHandler>, shared: Arc<DispatchShared>) -> Self {
        Self { handler, shared }
    }

    pub fn shared(&self) -> &Arc<DispatchShared> {
        &self.shared
    }

    /// Split the given messages into batches and spawn a consume task for each.
    pub fn submit(&self, progress: SharedProgress, msgs: Vec<PulledMessage>) {
        if self.shared.is_closed() {
            return;
        }
        let batch_size = self.shared.config.consume_batch_size.max(1);
        let mut msgs = msgs.into_iter().peekable();
        while msgs.peek().is_some() {
            let batch: Vec<_> = msgs.by_ref().take(batch_size).collect();
            let task = BatchTask {
                handler: self.handler.clone(),
                shared: self.shared.clone(),
                progress: progress.clone(),
            };
            tokio::spawn(task.run(batch));
        }
    }
}

/// A task driving a single batch until every message in it is terminal.
struct BatchTask {
    handler: Arc<dyn ConcurrentHandler>,
    shared: Arc<DispatchShared>,
    progress: SharedProgress,
}

impl BatchTask {
    async fn run(self, mut batch: Vec<PulledMessage>) {
        loop {
            let retries = match self.consume(&batch).await {
                Some(retries) => retries,
                None => return,
            };
            let delay = match retries.iter().map(|msg| msg.reconsume_count).max() {
                Some(reconsume_count) => self.shared.config.retry_delay(reconsume_count),
                None => return,
            };
            tracing::warn!(count = retries.len(), ?delay, "scheduling message redelivery");
            tokio::select! {
                _ = tokio::time::sleep(delay) => (),
                _ = self.shared.closed() => return,
            }
            batch = retries;
        }
    }

    /// Consume the batch once, returning the messages to redeliver.
    ///
    /// Returns `None` if the batch was abandoned because the dispatcher closed or the queue was
    /// revoked.
    async fn consume(&self, batch: &[PulledMessage]) -> Option<Vec<PulledMessage>> {
        let queue = batch.first()?.queue.clone();
        let _permit = self.shared.ready().await?;
        let _in_flight = self.shared.track();
        if self.progress.lock().await.is_dropped() {
            tracing::debug!(%queue, "queue revoked, abandoning batch");
            return None;
        }

        let mut ctx = ConsumeContext::new(queue.clone());
        tracing::trace!(%queue, count = batch.len(), "invoking concurrent handler");
        let outcome = self.shared.invoke(&queue, self.handler.consume(batch, &mut ctx)).await;
        let acked = match outcome {
            ConsumeOutcome::Success => ctx.ack_index.map_or(batch.len(), |idx| (idx + 1).min(batch.len())),
            ConsumeOutcome::RetryLater => 0,
            ConsumeOutcome::SuspendQueueAndRetry => {
                tracing::warn!(%queue, "queue suspension is not supported by the concurrent listener, retrying later");
                0
            }
        };
        let (done, failed) = batch.split_at(acked);
        self.shared.complete(&self.progress, done).await;
        Some(self.shared.redeliveries(&self.progress, failed).await)
    }
}
