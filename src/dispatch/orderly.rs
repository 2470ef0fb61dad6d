use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::DispatchShared;
use crate::handler::{ConsumeContext, OrderlyHandler};
use crate::message::{PulledMessage, QueueHandle};
use crate::offset::SharedProgress;

/// The dispatch phase of an ordered queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePhase {
    /// No consume task is running for the queue.
    Idle,
    /// The queue's single consume task is running.
    Locked,
    /// The consume task is waiting out a suspension before redelivering.
    Suspended,
    /// The queue has been revoked; nothing further is dispatched.
    Removed,
}

/// An ordered queue's backlog of admitted messages, keyed by offset.
pub struct OrderlyQueue {
    queue: QueueHandle,
    progress: SharedProgress,
    state: Mutex<OrderlyState>,
}

struct OrderlyState {
    backlog: BTreeMap<u64, PulledMessage>,
    phase: QueuePhase,
}

impl OrderlyQueue {
    fn new(queue: QueueHandle, progress: SharedProgress) -> Self {
        Self {
            queue,
            progress,
            state: Mutex::new(OrderlyState {
                backlog: BTreeMap::new(),
                phase: QueuePhase::Idle,
            }),
        }
    }

    pub async fn phase(&self) -> QueuePhase {
        self.state.lock().await.phase
    }

    pub async fn backlog_len(&self) -> usize {
        self.state.lock().await.backlog.len()
    }
}

/// Dispatches the messages of each queue serially, in offset order.
///
/// Each queue entry has at most one consume task at a time. A queue which is removed and then
/// re-registered gets a fresh entry while the old task may still be invoking the handler, so
/// every invocation also holds the queue's consume lock. Consume locks outlive their entries and
/// are only evicted once no task holds them.
pub struct OrderlyDispatcher {
    handler: Arc<dyn OrderlyHandler>,
    shared: Arc<DispatchShared>,
    queues: Mutex<HashMap<QueueHandle, Arc<OrderlyQueue>>>,
    consume_locks: Mutex<HashMap<QueueHandle, Arc<Mutex<()>>>>,
}

impl OrderlyDispatcher {
    /// Create a new instance.
    pub fn new(handler: Arc<dyn OrderlyHandler>, shared: Arc<DispatchShared>) -> Self {
        Self {
            handler,
            shared,
            queues: Mutex::new(HashMap::new()),
            consume_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared(&self) -> &Arc<DispatchShared> {
        &self.shared
    }

    /// Get the ordered queue state of the given queue.
    pub async fn queue(&self, queue: &QueueHandle) -> Option<Arc<OrderlyQueue>> {
        self.queues.lock().await.get(queue).cloned()
    }

    /// Enqueue admitted messages of a single queue, starting its consume task if idle.
    #[tracing::instrument(level = "trace", skip(self, progress, msgs), fields(count = msgs.len()))]
    pub async fn submit(&self, progress: SharedProgress, msgs: Vec<PulledMessage>) {
        let queue = match msgs.first() {
            Some(msg) => msg.queue.clone(),
            None => return,
        };
        if self.shared.is_closed() {
            return;
        }
        let entry = {
            let mut queues = self.queues.lock().await;
            let entry = queues
                .entry(queue.clone())
                .or_insert_with(|| Arc::new(OrderlyQueue::new(queue.clone(), progress.clone())));
            // A re-registered queue carries fresh progress; its stale entry is replaced.
            if !Arc::ptr_eq(&entry.progress, &progress) {
                *entry = Arc::new(OrderlyQueue::new(queue.clone(), progress.clone()));
            }
            entry.clone()
        };

        let mut state = entry.state.lock().await;
        if state.phase == QueuePhase::Removed {
            return;
        }
        state.backlog.extend(msgs.into_iter().map(|msg| (msg.offset, msg)));
        if state.phase == QueuePhase::Idle {
            state.phase = QueuePhase::Locked;
            let consume_lock = self.consume_locks.lock().await.entry(queue).or_default().clone();
            let task = QueueTask {
                handler: self.handler.clone(),
                shared: self.shared.clone(),
                entry: entry.clone(),
                consume_lock,
            };
            tokio::spawn(task.run());
        }
    }

    /// Stop dispatching the given queue and evict its state.
    ///
    /// An in-flight handler invocation runs to completion; nothing further is dispatched.
    #[tracing::instrument(level = "debug", skip(self), fields(queue = %queue))]
    pub async fn remove_queue(&self, queue: &QueueHandle) {
        let entry = match self.queues.lock().await.remove(queue) {
            Some(entry) => entry,
            None => return,
        };
        {
            let mut state = entry.state.lock().await;
            state.phase = QueuePhase::Removed;
            state.backlog.clear();
        }
        let mut locks = self.consume_locks.lock().await;
        if locks.get(queue).map_or(false, |lock| Arc::strong_count(lock) == 1) {
            locks.remove(queue);
        }
    }
}

/// The single consume task of an ordered queue.
struct QueueTask {
    handler: Arc<dyn OrderlyHandler>,
    shared: Arc<DispatchShared>,
    entry: Arc<OrderlyQueue>,
    consume_lock: Arc<Mutex<()>>,
}

impl QueueTask {
    async fn run(self) {
        let queue = self.entry.queue.clone();
        let batch_size = self.shared.config.consume_batch_size.max(1);
        loop {
            let batch: Vec<_> = {
                let mut state = self.entry.state.lock().await;
                if state.phase == QueuePhase::Removed {
                    return;
                }
                if state.backlog.is_empty() {
                    state.phase = QueuePhase::Idle;
                    return;
                }
                state.phase = QueuePhase::Locked;
                let offsets: Vec<u64> = state.backlog.keys().take(batch_size).copied().collect();
                offsets.iter().filter_map(|offset| state.backlog.remove(offset)).collect()
            };

            // Held until the outcome is recorded; a previous owner of this queue may still be running.
            let consuming = tokio::select! {
                guard = self.consume_lock.lock() => guard,
                _ = self.shared.closed() => return,
            };
            let permit = match self.shared.ready().await {
                Some(permit) => permit,
                None => return,
            };
            let in_flight = self.shared.track();
            if self.entry.progress.lock().await.is_dropped() || self.is_removed().await {
                tracing::debug!(%queue, "queue revoked, abandoning ordered batch");
                return;
            }

            let mut ctx = ConsumeContext::new(queue.clone());
            tracing::trace!(%queue, first = batch[0].offset, count = batch.len(), "invoking orderly handler");
            let outcome = self.shared.invoke(&queue, self.handler.consume(&batch, &mut ctx)).await;
            drop(permit);

            if outcome.is_success() {
                self.shared.complete(&self.entry.progress, &batch).await;
                continue;
            }

            let retries = self.shared.redeliveries(&self.entry.progress, &batch).await;
            let interval = ctx.suspend_override.unwrap_or_else(|| self.shared.config.suspend_queue());
            {
                let mut state = self.entry.state.lock().await;
                if state.phase == QueuePhase::Removed {
                    return;
                }
                state.backlog.extend(retries.into_iter().map(|msg| (msg.offset, msg)));
                state.phase = QueuePhase::Suspended;
            }
            drop(in_flight);
            drop(consuming);
            tracing::warn!(%queue, ?interval, ?outcome, "suspending ordered queue before redelivery");
            tokio::select! {
                _ = tokio::time::sleep(interval) => (),
                _ = self.shared.closed() => return,
            }
        }
    }

    async fn is_removed(&self) -> bool {
        self.entry.state.lock().await.phase == QueuePhase::Removed
    }
}
