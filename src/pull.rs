//! Per-queue pull loops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use backoff::{backoff::Backoff, ExponentialBackoff};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::assignment::AssignmentView;
use crate::config::ConsumerConfig;
use crate::dispatch::Dispatcher;
use crate::flow::FlowController;
use crate::message::{PulledMessage, QueueHandle};
use crate::offset::SharedProgress;
use crate::subscription::{SubscriptionEntry, SubscriptionRegistry};
use crate::transport::Transport;
use crate::{METRIC_MESSAGES_FILTERED, METRIC_PULL_ERRORS};

/// Slack added to the long-poll timeout to form the client-side fetch deadline.
const FETCH_DEADLINE_SLACK: Duration = Duration::from_secs(5);

/// The reason a pull loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullLoopExit {
    /// The loop was told to stop, or the consumer is shutting down.
    Stopped,
    /// The queue is no longer assigned to this consumer.
    Revoked,
    /// The queue's topic is no longer subscribed.
    Unsubscribed,
}

/// Notification sent to the controller when a pull loop stops on its own.
#[derive(Clone, Debug)]
pub struct PullLoopExited {
    pub queue: QueueHandle,
    /// The generation of the loop, distinguishing restarts of the same queue.
    pub generation: u64,
    pub reason: PullLoopExit,
}

/// Collaborators shared by every pull loop of a consumer.
#[derive(Clone)]
pub struct PullContext {
    pub config: Arc<ConsumerConfig>,
    pub transport: Arc<dyn Transport>,
    pub assignment: AssignmentView,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub flow: Arc<FlowController>,
    pub dispatcher: Arc<Dispatcher>,
}

/// A long-polling fetch loop for a single owned queue.
///
/// Pulls messages in offset order, filters them against the current subscription and hands the
/// admitted ones to the dispatcher. Transport errors are retried with exponential backoff and
/// never surface beyond this loop.
pub struct PullLoop {
    ctx: PullContext,
    queue: QueueHandle,
    generation: u64,
    next_offset: u64,
    progress: SharedProgress,
    backoff: ExponentialBackoff,
    stop: watch::Receiver<bool>,
    exits: mpsc::UnboundedSender<PullLoopExited>,
}

impl PullLoop {
    /// Create a new instance which starts pulling at `next_offset`.
    pub fn new(
        ctx: PullContext, queue: QueueHandle, generation: u64, next_offset: u64, progress: SharedProgress, stop: watch::Receiver<bool>,
        exits: mpsc::UnboundedSender<PullLoopExited>,
    ) -> Self {
        let backoff = Self::backoff(&ctx.config);
        Self {
            ctx,
            queue,
            generation,
            next_offset,
            progress,
            backoff,
            stop,
            exits,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// The backoff config to use for transport errors.
    fn backoff(config: &ConsumerConfig) -> ExponentialBackoff {
        let mut new = ExponentialBackoff::default();
        new.initial_interval = Duration::from_millis(config.pull_backoff_initial_ms);
        new.current_interval = new.initial_interval;
        new.max_interval = Duration::from_millis(config.pull_backoff_max_ms);
        new.max_elapsed_time = None;
        new
    }

    async fn run(mut self) {
        tracing::debug!(queue = %self.queue, offset = self.next_offset, "pull loop started");
        let reason = self.pull_until_exit().await;
        tracing::debug!(queue = %self.queue, ?reason, "pull loop stopped");
        if reason != PullLoopExit::Stopped {
            let _res = self.exits.send(PullLoopExited {
                queue: self.queue.clone(),
                generation: self.generation,
                reason,
            });
        }
    }

    async fn pull_until_exit(&mut self) -> PullLoopExit {
        loop {
            if *self.stop.borrow() {
                return PullLoopExit::Stopped;
            }
            if !self.ctx.assignment.contains(&self.queue) {
                return PullLoopExit::Revoked;
            }
            let subscription = match self.ctx.subscriptions.get(&self.queue.topic) {
                Some(subscription) => subscription,
                None => return PullLoopExit::Unsubscribed,
            };
            if self.ctx.flow.is_suspended() {
                if !self.pause(self.ctx.config.suspend_delay()).await {
                    return PullLoopExit::Stopped;
                }
                continue;
            }
            if self.over_threshold().await {
                if !self.pause(self.ctx.config.flow_control_delay()).await {
                    return PullLoopExit::Stopped;
                }
                continue;
            }

            match self.fetch().await {
                None => return PullLoopExit::Stopped,
                Some(Ok(msgs)) => {
                    self.backoff.reset();
                    self.handle_batch(&subscription, msgs).await;
                }
                Some(Err(err)) => {
                    metrics::increment_counter!(METRIC_PULL_ERRORS);
                    let delay = self.backoff.next_backoff().unwrap_or(self.backoff.max_interval);
                    tracing::error!(error = ?err, queue = %self.queue, offset = self.next_offset, ?delay, "error pulling messages");
                    if !self.pause(delay).await {
                        return PullLoopExit::Stopped;
                    }
                }
            }
        }
    }

    /// Issue a single long-poll fetch, returning `None` if the loop is stopped first.
    #[tracing::instrument(level = "trace", skip(self), fields(queue = %self.queue, offset = self.next_offset))]
    async fn fetch(&self) -> Option<anyhow::Result<Vec<PulledMessage>>> {
        let (config, mut stop) = (&self.ctx.config, self.stop.clone());
        let deadline = config.poll_timeout() + FETCH_DEADLINE_SLACK;
        let pull = self
            .ctx
            .transport
            .pull(&self.queue, self.next_offset, config.pull_batch_size, config.poll_timeout());
        tokio::select! {
            res = tokio::time::timeout(deadline, pull) => Some(match res {
                Ok(res) => res,
                Err(_elapsed) => Err(anyhow!("pull exceeded its deadline of {:?}", deadline)),
            }),
            _ = stopped(&mut stop) => None,
        }
    }

    /// Filter a pulled batch, record it and hand the admitted messages to the dispatcher.
    async fn handle_batch(&mut self, subscription: &SubscriptionEntry, msgs: Vec<PulledMessage>) {
        let admitted = {
            let mut progress = self.progress.lock().await;
            let next_offset = self.next_offset;
            let fresh: Vec<_> = msgs
                .into_iter()
                .filter(|msg| msg.queue == self.queue && msg.offset >= next_offset && !progress.is_stale(msg.offset))
                .collect();
            if fresh.is_empty() {
                return;
            }
            let all: Vec<u64> = fresh.iter().map(|msg| msg.offset).collect();
            let (admitted, filtered): (Vec<_>, Vec<_>) = fresh.into_iter().partition(|msg| subscription.admits(msg));
            if !filtered.is_empty() {
                metrics::counter!(METRIC_MESSAGES_FILTERED, filtered.len() as u64);
                tracing::trace!(queue = %self.queue, count = filtered.len(), "messages rejected by subscription filter");
            }
            progress.record_pulled(all, admitted.iter().map(|msg| msg.offset));
            if let Some(next) = progress.next_offset() {
                self.next_offset = self.next_offset.max(next);
            }
            admitted
        };
        if !admitted.is_empty() {
            self.ctx.dispatcher.submit(self.progress.clone(), admitted).await;
        }
    }

    /// Check if the queue's cached backlog is over its configured limits.
    async fn over_threshold(&self) -> bool {
        let progress = self.progress.lock().await;
        let config = &self.ctx.config;
        if progress.pending_count() >= config.pull_threshold_per_queue {
            tracing::trace!(queue = %self.queue, pending = progress.pending_count(), "cached message count over threshold");
            return true;
        }
        if self.ctx.dispatcher.limits_span() && progress.pending_span() >= config.max_span {
            tracing::trace!(queue = %self.queue, span = progress.pending_span(), "cached message span over threshold");
            return true;
        }
        false
    }

    /// Sleep for the given duration, returning `false` if the loop is stopped first.
    async fn pause(&self, delay: Duration) -> bool {
        let mut stop = self.stop.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stopped(&mut stop) => false,
        }
    }
}

/// Resolves once the given stop signal is raised or its sender is dropped.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
