use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::OffsetStore;
use crate::message::QueueHandle;
use crate::METRIC_COMMIT_ERRORS;

/// A handle to the progress of a single queue, shared by its pull loop and the dispatcher.
pub type SharedProgress = Arc<Mutex<QueueProgress>>;

/// The consumption progress of a single queue.
///
/// `pending` holds every admitted offset which has not yet reached a terminal disposition. The
/// committable offset is one below the lowest pending offset, or the highest pulled offset when
/// nothing is pending, so it never advances past a gap.
#[derive(Debug, Default)]
pub struct QueueProgress {
    /// The highest offset known to be fully consumed, including everything below it.
    consumed: Option<u64>,
    /// The highest offset pulled so far, admitted or not.
    high_water: Option<u64>,
    /// Admitted offsets which are not yet terminal.
    pending: BTreeSet<u64>,
    /// The last offset handed to the offset store.
    persisted: Option<u64>,
    /// Set once the queue has been revoked; no further work is dispatched for it.
    dropped: bool,
}

impl QueueProgress {
    /// Create a new instance from the last consumed offset loaded from the offset store.
    pub fn new(loaded: Option<u64>) -> Self {
        Self {
            consumed: loaded,
            high_water: loaded,
            persisted: loaded,
            ..Default::default()
        }
    }

    /// Record a pulled batch.
    ///
    /// `all` holds every pulled offset, `admitted` the subset which passed the subscription
    /// filter. Filtered offsets are terminal the moment they are pulled.
    pub fn record_pulled(&mut self, all: impl IntoIterator<Item = u64>, admitted: impl IntoIterator<Item = u64>) {
        if let Some(max) = all.into_iter().max() {
            self.high_water = Some(self.high_water.map_or(max, |hw| hw.max(max)));
        }
        self.pending.extend(admitted);
        self.refresh();
    }

    /// Mark the given offset as terminal.
    pub fn complete(&mut self, offset: u64) {
        self.pending.remove(&offset);
        self.refresh();
    }

    /// The offset which may currently be committed.
    pub fn committable(&self) -> Option<u64> {
        self.consumed
    }

    /// The offset from which the next pull should start.
    pub fn next_offset(&self) -> Option<u64> {
        self.high_water.map(|hw| hw.saturating_add(1))
    }

    /// The number of admitted offsets which are not yet terminal.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The span between the lowest and highest pending offsets.
    pub fn pending_span(&self) -> u64 {
        match (self.pending.iter().next(), self.pending.iter().next_back()) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0,
        }
    }

    /// Check if the given offset is still pending.
    pub fn is_pending(&self, offset: u64) -> bool {
        self.pending.contains(&offset)
    }

    /// Check if the given offset has already been pulled.
    pub fn is_stale(&self, offset: u64) -> bool {
        matches!(self.high_water, Some(hw) if offset <= hw)
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    pub(crate) fn mark_dropped(&mut self) {
        self.dropped = true;
    }

    /// The committable offset, if it has moved past the last persisted offset.
    fn needs_commit(&self) -> Option<u64> {
        match (self.consumed, self.persisted) {
            (Some(consumed), Some(persisted)) if consumed <= persisted => None,
            (consumed, _) => consumed,
        }
    }

    fn refresh(&mut self) {
        let candidate = match self.pending.iter().next() {
            Some(0) => None,
            Some(lowest) => Some(lowest - 1),
            None => self.high_water,
        };
        self.consumed = match (self.consumed, candidate) {
            (Some(current), Some(candidate)) => Some(current.max(candidate)),
            (current, candidate) => current.or(candidate),
        };
    }
}

/// Tracks the progress of every consumed queue and commits it to the offset store.
pub struct OffsetTracker {
    store: Arc<dyn OffsetStore>,
    queues: Mutex<HashMap<QueueHandle, SharedProgress>>,
}

impl OffsetTracker {
    /// Create a new instance.
    pub fn new(store: Arc<dyn OffsetStore>) -> Self {
        Self {
            store,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying offset store.
    pub fn store(&self) -> &Arc<dyn OffsetStore> {
        &self.store
    }

    /// Begin tracking the given queue, starting from the given last consumed offset.
    ///
    /// Any progress already tracked for the queue is replaced.
    pub async fn register(&self, queue: QueueHandle, loaded: Option<u64>) -> SharedProgress {
        let progress = Arc::new(Mutex::new(QueueProgress::new(loaded)));
        let previous = self.queues.lock().await.insert(queue, progress.clone());
        if let Some(previous) = previous {
            previous.lock().await.mark_dropped();
        }
        progress
    }

    /// Get the progress handle of the given queue.
    pub async fn progress(&self, queue: &QueueHandle) -> Option<SharedProgress> {
        self.queues.lock().await.get(queue).cloned()
    }

    /// Get the offset which may currently be committed for the given queue.
    pub async fn get_committable(&self, queue: &QueueHandle) -> Option<u64> {
        let progress = self.progress(queue).await?;
        let committable = progress.lock().await.committable();
        committable
    }

    /// Commit every queue whose committable offset has moved since its last commit.
    ///
    /// Failures are logged and retried on the next call. Returns the number of queues committed.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn commit_all(&self) -> usize {
        let queues: Vec<_> = self
            .queues
            .lock()
            .await
            .iter()
            .map(|(queue, progress)| (queue.clone(), progress.clone()))
            .collect();
        let mut committed = 0;
        for (queue, progress) in queues {
            if self.commit_queue(&queue, &progress).await {
                committed += 1;
            }
        }
        committed
    }

    /// Stop tracking the given queue, making a final best-effort commit of its progress.
    #[tracing::instrument(level = "debug", skip(self), fields(queue = %queue))]
    pub async fn remove(&self, queue: &QueueHandle) {
        let progress = match self.queues.lock().await.remove(queue) {
            Some(progress) => progress,
            None => return,
        };
        progress.lock().await.mark_dropped();
        self.commit_queue(queue, &progress).await;
    }

    async fn commit_queue(&self, queue: &QueueHandle, progress: &SharedProgress) -> bool {
        let offset = match progress.lock().await.needs_commit() {
            Some(offset) => offset,
            None => return false,
        };
        if let Err(err) = self.store.commit_offset(queue, offset).await {
            metrics::increment_counter!(METRIC_COMMIT_ERRORS);
            tracing::error!(error = ?err, %queue, offset, "error committing queue offset");
            return false;
        }
        let mut progress = progress.lock().await;
        progress.persisted = Some(progress.persisted.map_or(offset, |persisted| persisted.max(offset)));
        tracing::trace!(%queue, offset, "queue offset committed");
        true
    }
}
