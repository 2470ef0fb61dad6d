//! Message dispatch.
//!
//! The dispatcher owns admitted messages from the moment a pull loop hands them over until they
//! reach a terminal disposition: success, dead-letter, or abandonment at shutdown. Offsets are
//! completed in the queue's progress only on a terminal disposition.

mod concurrent;
mod orderly;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::prelude::*;
use tokio::sync::{watch, Notify};

use crate::config::ConsumerConfig;
use crate::flow::{FlowController, PoolPermit};
use crate::handler::{DeadLetterSink, MessageListener};
use crate::message::{ConsumeOutcome, PulledMessage, QueueHandle};
use crate::offset::SharedProgress;
use crate::{METRIC_MESSAGES_CONSUMED, METRIC_MESSAGES_DEAD_LETTERED, METRIC_MESSAGES_RETRIED};

pub use concurrent::ConcurrentDispatcher;
pub use orderly::{OrderlyDispatcher, OrderlyQueue, QueuePhase};

/// The dispatcher of a running consumer, selected by its registered listener.
pub enum Dispatcher {
    Concurrent(ConcurrentDispatcher),
    Orderly(OrderlyDispatcher),
}

impl Dispatcher {
    /// Build the dispatcher for the given listener.
    pub fn new(listener: MessageListener, shared: Arc<DispatchShared>) -> Self {
        match listener {
            MessageListener::Concurrent(handler) => Self::Concurrent(ConcurrentDispatcher::new(handler, shared)),
            MessageListener::Orderly(handler) => Self::Orderly(OrderlyDispatcher::new(handler, shared)),
        }
    }

    /// Hand admitted messages of a single queue over for consumption.
    pub async fn submit(&self, progress: SharedProgress, msgs: Vec<PulledMessage>) {
        match self {
            Self::Concurrent(inner) => inner.submit(progress, msgs),
            Self::Orderly(inner) => inner.submit(progress, msgs).await,
        }
    }

    /// Stop dispatching work for the given queue.
    pub async fn remove_queue(&self, queue: &QueueHandle) {
        if let Self::Orderly(inner) = self {
            inner.remove_queue(queue).await;
        }
    }

    /// Check if per-queue offset span limits apply to this dispatcher.
    pub fn limits_span(&self) -> bool {
        matches!(self, Self::Concurrent(_))
    }

    pub fn shared(&self) -> &Arc<DispatchShared> {
        match self {
            Self::Concurrent(inner) => inner.shared(),
            Self::Orderly(inner) => inner.shared(),
        }
    }
}

/// State shared by the dispatcher and all of its tasks.
pub struct DispatchShared {
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) flow: Arc<FlowController>,
    pub(crate) dead_letters: Arc<dyn DeadLetterSink>,
    in_flight: InFlight,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl DispatchShared {
    /// Create a new instance.
    pub fn new(config: Arc<ConsumerConfig>, flow: Arc<FlowController>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            config,
            flow,
            dead_letters,
            in_flight: InFlight::default(),
            closed_tx,
            closed_rx,
        }
    }

    /// Stop starting new work. Running handler invocations are not interrupted.
    pub fn close(&self) {
        let _res = self.closed_tx.send(true);
        self.flow.pool().close();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// Resolves once the dispatcher has been closed.
    pub async fn closed(&self) {
        let mut closed = self.closed_rx.clone();
        loop {
            if *closed.borrow_and_update() {
                return;
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    /// The number of handler invocations currently running or recording their outcome.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait for in-flight work to finish, up to the given grace period.
    ///
    /// Returns `false` if the grace period elapsed first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.in_flight.wait_idle()).await.is_ok()
    }

    /// Acquire a worker permit once the consumer is not suspended.
    ///
    /// Returns `None` if the dispatcher closes first.
    pub(crate) async fn ready(&self) -> Option<PoolPermit> {
        tokio::select! {
            _ = self.flow.wait_resumed() => (),
            _ = self.closed() => return None,
        }
        let permit = tokio::select! {
            permit = self.flow.pool().acquire() => permit?,
            _ = self.closed() => return None,
        };
        // Suspension may have begun while waiting for the permit.
        if self.flow.is_suspended() {
            drop(permit);
            tokio::select! {
                _ = self.flow.wait_resumed() => (),
                _ = self.closed() => return None,
            }
            return tokio::select! {
                permit = self.flow.pool().acquire() => permit,
                _ = self.closed() => None,
            };
        }
        Some(permit)
    }

    /// Count a unit of work as in flight until the returned guard drops.
    ///
    /// Callers hold the guard across the handler invocation and the recording of its outcome,
    /// dead-lettering included, so that `wait_idle` covers both.
    pub(crate) fn track(&self) -> InFlightGuard<'_> {
        self.in_flight.enter()
    }

    /// Invoke a handler, mapping errors and panics to `RetryLater`.
    pub(crate) async fn invoke<F>(&self, queue: &QueueHandle, fut: F) -> ConsumeOutcome
    where
        F: Future<Output = anyhow::Result<ConsumeOutcome>>,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                tracing::warn!(error = ?err, %queue, "message handler returned an error, will retry");
                ConsumeOutcome::RetryLater
            }
            Err(_panic) => {
                tracing::error!(%queue, "message handler panicked, will retry");
                ConsumeOutcome::RetryLater
            }
        }
    }

    /// Mark the given messages as successfully consumed.
    pub(crate) async fn complete(&self, progress: &SharedProgress, msgs: &[PulledMessage]) {
        let mut progress = progress.lock().await;
        for msg in msgs {
            progress.complete(msg.offset);
        }
        metrics::counter!(METRIC_MESSAGES_CONSUMED, msgs.len() as u64);
    }

    /// Split failed messages into redeliveries, dead-lettering and completing exhausted ones.
    pub(crate) async fn redeliveries(&self, progress: &SharedProgress, msgs: &[PulledMessage]) -> Vec<PulledMessage> {
        let mut retries = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if self.config.retries_exhausted(msg.reconsume_count) {
                self.dead_letter(msg).await;
                progress.lock().await.complete(msg.offset);
            } else {
                retries.push(msg.redelivery());
            }
        }
        metrics::counter!(METRIC_MESSAGES_RETRIED, retries.len() as u64);
        retries
    }

    /// Route the given message to the dead-letter sink.
    ///
    /// A failing sink is logged but the disposition stays terminal.
    async fn dead_letter(&self, msg: &PulledMessage) {
        let reason = format!("exhausted {} redeliveries", msg.reconsume_count);
        metrics::increment_counter!(METRIC_MESSAGES_DEAD_LETTERED);
        tracing::error!(queue = %msg.queue, offset = msg.offset, reconsume_count = msg.reconsume_count, "dead-lettering message");
        if let Err(err) = self.dead_letters.dead_letter(msg, &reason).await {
            tracing::error!(error = ?err, queue = %msg.queue, offset = msg.offset, "error handing message to dead-letter sink");
        }
    }
}

/// A counter of in-flight work.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self)
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

pub(crate) struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
