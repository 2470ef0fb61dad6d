//! The view of queue ownership published by the group rebalancer.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use crate::message::QueueHandle;

/// The set of queues currently assigned to this consumer.
///
/// The rebalancer owns this view and calls `update` whenever ownership changes. The consumer only
/// ever reads it; pull loops check it at the top of every cycle and stop as soon as their queue
/// is no longer present.
#[derive(Clone)]
pub struct AssignmentView {
    queues: Arc<ArcSwap<BTreeSet<QueueHandle>>>,
    changes_tx: Arc<watch::Sender<u64>>,
    changes_rx: watch::Receiver<u64>,
}

impl Default for AssignmentView {
    fn default() -> Self {
        Self::new(BTreeSet::new())
    }
}

impl AssignmentView {
    /// Create a new instance with the given initial assignment.
    pub fn new(initial: BTreeSet<QueueHandle>) -> Self {
        let (changes_tx, changes_rx) = watch::channel(0);
        Self {
            queues: Arc::new(ArcSwap::from_pointee(initial)),
            changes_tx: Arc::new(changes_tx),
            changes_rx,
        }
    }

    /// Atomically replace the assigned queue set.
    #[tracing::instrument(level = "debug", skip(self, queues), fields(count = queues.len()))]
    pub fn update(&self, queues: BTreeSet<QueueHandle>) {
        self.queues.store(Arc::new(queues));
        let next = *self.changes_rx.borrow() + 1;
        let _res = self.changes_tx.send(next);
    }

    /// A snapshot of the currently assigned queues.
    pub fn assigned_queues(&self) -> Arc<BTreeSet<QueueHandle>> {
        self.queues.load_full()
    }

    /// Check if the given queue is currently assigned.
    pub fn contains(&self, queue: &QueueHandle) -> bool {
        self.queues.load().contains(queue)
    }

    /// A signal which changes whenever the assignment is updated.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes_rx.clone()
    }
}
