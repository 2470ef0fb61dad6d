//! The push consumer and its controller.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::prelude::*;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};

use crate::assignment::AssignmentView;
use crate::config::ConsumerConfig;
use crate::dispatch::{DispatchShared, Dispatcher};
use crate::error::{ConsumerError, Result};
use crate::filter::MessageSelector;
use crate::flow::FlowController;
use crate::handler::{DeadLetterSink, LoggingDeadLetterSink, MessageListener};
use crate::message::QueueHandle;
use crate::offset::{OffsetStore, OffsetTracker, StartingPoint};
use crate::pull::{PullContext, PullLoop, PullLoopExit, PullLoopExited};
use crate::subscription::SubscriptionRegistry;
use crate::transport::Transport;

/// The lifecycle state of a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// Created but not yet started.
    CreateJust,
    /// Started and consuming.
    Running,
    /// Shut down; no further operations are accepted.
    ShutdownAlready,
    /// A call to `start` failed; the consumer can only be shut down.
    StartFailed,
}

/// A consumer which long-polls its assigned queues and pushes messages to a registered listener.
///
/// The set of queues consumed at any time is the intersection of the queues assigned by the
/// external rebalancer and the subscribed topics. Offsets are committed periodically and once
/// more at shutdown, with at-least-once delivery semantics.
pub struct PushConsumer {
    config: Arc<ConsumerConfig>,
    transport: Arc<dyn Transport>,
    assignment: AssignmentView,
    subscriptions: Arc<SubscriptionRegistry>,
    flow: Arc<FlowController>,
    tracker: Arc<OffsetTracker>,
    runtime: Mutex<Runtime>,
}

/// Mutable lifecycle state of a consumer.
struct Runtime {
    state: ServiceState,
    listener: Option<MessageListener>,
    dead_letters: Arc<dyn DeadLetterSink>,
    dispatcher: Option<Arc<Dispatcher>>,
    shutdown: Option<broadcast::Sender<()>>,
    ctl: Option<JoinHandle<()>>,
}

impl PushConsumer {
    /// Create a new consumer.
    ///
    /// The assignment view is owned by the rebalancer, which keeps updating it for the lifetime
    /// of the consumer.
    pub fn new(config: ConsumerConfig, transport: Arc<dyn Transport>, assignment: AssignmentView, offset_store: Arc<dyn OffsetStore>) -> Result<Self> {
        config.validate()?;
        crate::register_metrics();
        let flow = Arc::new(FlowController::new(config.core_pool_size));
        Ok(Self {
            config: Arc::new(config),
            transport,
            assignment,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            flow,
            tracker: Arc::new(OffsetTracker::new(offset_store)),
            runtime: Mutex::new(Runtime {
                state: ServiceState::CreateJust,
                listener: None,
                dead_letters: Arc::new(LoggingDeadLetterSink),
                dispatcher: None,
                shutdown: None,
                ctl: None,
            }),
        })
    }

    /// The current lifecycle state of this consumer.
    pub fn state(&self) -> ServiceState {
        self.runtime().state
    }

    /// Register the listener which will receive messages, replacing any earlier registration.
    ///
    /// The listener also selects the consumption mode, and may only be registered before start.
    pub fn register_message_listener(&self, listener: MessageListener) -> Result<()> {
        let mut runtime = self.runtime();
        Self::ensure_state(runtime.state, ServiceState::CreateJust, "message listeners may only be registered before start")?;
        tracing::debug!(mode = listener.mode(), "message listener registered");
        runtime.listener = Some(listener);
        Ok(())
    }

    /// Set the sink receiving messages which exhausted their redeliveries.
    pub fn set_dead_letter_sink(&self, sink: Arc<dyn DeadLetterSink>) -> Result<()> {
        let mut runtime = self.runtime();
        Self::ensure_state(runtime.state, ServiceState::CreateJust, "the dead-letter sink may only be set before start")?;
        runtime.dead_letters = sink;
        Ok(())
    }

    /// Subscribe to a topic with a tag expression such as `"tag1 || tag2"`; `"*"` selects all.
    pub fn subscribe(&self, topic: &str, expression: &str) -> Result<()> {
        self.subscribe_with_selector(topic, MessageSelector::by_tag(Some(expression)))
    }

    /// Subscribe to a topic with the given selector.
    ///
    /// Re-subscribing a topic replaces its expression; re-subscribing with an identical
    /// expression is a no-op. After start, changes take effect on the next pull cycle.
    pub fn subscribe_with_selector(&self, topic: &str, selector: MessageSelector) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.subscriptions.subscribe(topic, &selector)?;
        Ok(())
    }

    /// Remove the subscription of the given topic.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.subscriptions.unsubscribe(topic);
        Ok(())
    }

    /// The subscriptions of this consumer.
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Resize the worker pool; in-flight work is never preempted.
    pub fn update_core_pool_size(&self, size: usize) -> Result<()> {
        self.ensure_not_shutdown()?;
        self.flow.update_core_pool_size(size)
    }

    /// Stop fetching and dispatching until `resume` is called.
    pub fn suspend(&self) {
        self.flow.suspend();
    }

    pub fn resume(&self) {
        self.flow.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.flow.is_suspended()
    }

    /// The offset which may currently be committed for the given queue.
    pub async fn committable(&self, queue: &QueueHandle) -> Option<u64> {
        self.tracker.get_committable(queue).await
    }

    /// Commit the progress of every consumed queue now, returning the number of queues committed.
    pub async fn commit_offsets(&self) -> usize {
        self.tracker.commit_all().await
    }

    /// Start consuming.
    #[tracing::instrument(level = "debug", skip(self), fields(group = %self.config.consumer_group))]
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime();
        Self::ensure_state(runtime.state, ServiceState::CreateJust, "the consumer has already been started")?;
        let listener = match runtime.listener.clone() {
            Some(listener) => listener,
            None => {
                runtime.state = ServiceState::StartFailed;
                return Err(ConsumerError::IllegalState("a message listener must be registered before start".into()));
            }
        };

        let shared = Arc::new(DispatchShared::new(self.config.clone(), self.flow.clone(), runtime.dead_letters.clone()));
        let dispatcher = Arc::new(Dispatcher::new(listener, shared));
        let (shutdown, _) = broadcast::channel(1);
        let ctx = PullContext {
            config: self.config.clone(),
            transport: self.transport.clone(),
            assignment: self.assignment.clone(),
            subscriptions: self.subscriptions.clone(),
            flow: self.flow.clone(),
            dispatcher: dispatcher.clone(),
        };
        let ctl = ConsumerCtl::new(ctx, self.tracker.clone(), shutdown.clone()).spawn();

        runtime.dispatcher = Some(dispatcher);
        runtime.shutdown = Some(shutdown);
        runtime.ctl = Some(ctl);
        runtime.state = ServiceState::Running;
        tracing::debug!("push consumer started");
        Ok(())
    }

    /// Shut down this consumer.
    ///
    /// Pull loops are stopped, no new work is dispatched, and in-flight handler invocations are
    /// given the configured grace period to finish before a final offset commit. Calling this
    /// more than once has no further effect.
    #[tracing::instrument(level = "debug", skip(self), fields(group = %self.config.consumer_group))]
    pub async fn shutdown(&self) {
        let (shutdown, ctl, dispatcher) = {
            let mut runtime = self.runtime();
            let was_running = runtime.state == ServiceState::Running;
            runtime.state = ServiceState::ShutdownAlready;
            if !was_running {
                return;
            }
            (runtime.shutdown.take(), runtime.ctl.take(), runtime.dispatcher.take())
        };

        if let Some(shutdown) = shutdown {
            let _res = shutdown.send(());
        }
        if let Some(ctl) = ctl {
            if let Err(err) = ctl.await {
                tracing::error!(error = ?err, "error awaiting consumer controller shutdown");
            }
        }
        if let Some(dispatcher) = dispatcher {
            let shared = dispatcher.shared();
            shared.close();
            if !shared.wait_idle(self.config.shutdown_grace()).await {
                tracing::warn!(in_flight = shared.in_flight(), "shutdown grace period elapsed with handlers still running");
            }
        }
        let committed = self.tracker.commit_all().await;
        tracing::debug!(committed, "push consumer shut down");
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        match self.runtime.lock() {
            Ok(runtime) => runtime,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_state(current: ServiceState, expected: ServiceState, msg: &str) -> Result<()> {
        if current != expected {
            return Err(ConsumerError::IllegalState(format!("{}, consumer is {:?}", msg, current)));
        }
        Ok(())
    }

    fn ensure_not_shutdown(&self) -> Result<()> {
        match self.state() {
            ServiceState::ShutdownAlready => Err(ConsumerError::IllegalState("the consumer has been shut down".into())),
            _ => Ok(()),
        }
    }
}

/// A handle to a running pull loop.
struct LoopHandle {
    generation: u64,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The consumer's controller task.
///
/// Reconciles the running pull loops against the assignment and subscriptions, and drives
/// periodic offset commits.
struct ConsumerCtl {
    ctx: PullContext,
    tracker: Arc<OffsetTracker>,
    shutdown: broadcast::Sender<()>,

    loops: HashMap<QueueHandle, LoopHandle>,
    next_generation: u64,
    exits_tx: mpsc::UnboundedSender<PullLoopExited>,
    exits_rx: UnboundedReceiverStream<PullLoopExited>,
}

impl ConsumerCtl {
    fn new(ctx: PullContext, tracker: Arc<OffsetTracker>, shutdown: broadcast::Sender<()>) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            tracker,
            shutdown,
            loops: HashMap::new(),
            next_generation: 0,
            exits_tx,
            exits_rx: UnboundedReceiverStream::new(exits_rx),
        }
    }

    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(group = %self.ctx.config.consumer_group, "consumer controller started");
        let mut shutdown = BroadcastStream::new(self.shutdown.subscribe());
        let mut assignment_changes = self.ctx.assignment.changes();
        let mut subscription_changes = self.ctx.subscriptions.changes();
        let mut commit_interval = tokio::time::interval(self.ctx.config.commit_interval());

        self.reconcile().await;
        loop {
            tokio::select! {
                Ok(_) = assignment_changes.changed() => self.reconcile().await,
                Ok(_) = subscription_changes.changed() => self.reconcile().await,
                Some(exit) = self.exits_rx.next() => self.handle_loop_exit(exit).await,
                _ = commit_interval.tick() => {
                    self.tracker.commit_all().await;
                    // Retries queues whose start failed.
                    self.reconcile().await;
                }
                _ = shutdown.next() => break,
            }
        }

        let queues: Vec<_> = self.loops.keys().cloned().collect();
        for queue in queues {
            self.stop_loop(&queue).await;
        }
        tracing::debug!(group = %self.ctx.config.consumer_group, "consumer controller stopped");
    }

    /// Start and stop pull loops so that exactly the assigned and subscribed queues are pulled.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn reconcile(&mut self) {
        let assigned = self.ctx.assignment.assigned_queues();
        let subscriptions = self.ctx.subscriptions.snapshot();
        let desired: BTreeSet<QueueHandle> = assigned.iter().filter(|queue| subscriptions.contains_key(&queue.topic)).cloned().collect();

        let released: Vec<_> = self.loops.keys().filter(|queue| !desired.contains(*queue)).cloned().collect();
        for queue in released {
            self.stop_loop(&queue).await;
            self.release_queue(&queue).await;
        }
        for queue in desired {
            if !self.loops.contains_key(&queue) {
                self.start_loop(queue).await;
            }
        }
    }

    /// Handle a pull loop which stopped on its own.
    #[tracing::instrument(level = "debug", skip(self, exit), fields(queue = %exit.queue, reason = ?exit.reason))]
    async fn handle_loop_exit(&mut self, exit: PullLoopExited) {
        let is_current = matches!(self.loops.get(&exit.queue), Some(handle) if handle.generation == exit.generation);
        if !is_current {
            return;
        }
        self.loops.remove(&exit.queue);
        if exit.reason != PullLoopExit::Stopped {
            self.release_queue(&exit.queue).await;
        }
        self.reconcile().await;
    }

    /// Load the queue's offset and start its pull loop.
    #[tracing::instrument(level = "debug", skip(self), fields(queue = %queue))]
    async fn start_loop(&mut self, queue: QueueHandle) {
        let (loaded, next_offset) = match self.resolve_start(&queue).await {
            Ok(start) => start,
            Err(err) => {
                tracing::error!(error = ?err, %queue, "error resolving start offset of queue, will retry");
                return;
            }
        };
        let progress = self.tracker.register(queue.clone(), loaded).await;
        let (stop, stop_rx) = watch::channel(false);
        let generation = self.next_generation;
        self.next_generation += 1;
        let handle = PullLoop::new(self.ctx.clone(), queue.clone(), generation, next_offset, progress, stop_rx, self.exits_tx.clone()).spawn();
        tracing::debug!(%queue, next_offset, "queue consumption started");
        self.loops.insert(queue, LoopHandle { generation, stop, handle });
    }

    /// Resolve the last consumed offset and the first offset to fetch for the given queue.
    async fn resolve_start(&self, queue: &QueueHandle) -> anyhow::Result<(Option<u64>, u64)> {
        if let Some(stored) = self.tracker.store().load_offset(queue).await? {
            return Ok((Some(stored), stored.saturating_add(1)));
        }
        let next_offset = match self.ctx.config.starting_point {
            StartingPoint::Beginning => 0,
            StartingPoint::Offset(offset) => offset,
            StartingPoint::Latest => self.ctx.transport.max_offset(queue).await?,
        };
        Ok((next_offset.checked_sub(1), next_offset))
    }

    /// Signal the given queue's pull loop to stop and wait for it.
    async fn stop_loop(&mut self, queue: &QueueHandle) {
        let handle = match self.loops.remove(queue) {
            Some(handle) => handle,
            None => return,
        };
        let _res = handle.stop.send(true);
        if let Err(err) = handle.handle.await {
            tracing::error!(error = ?err, %queue, "error awaiting pull loop shutdown");
        }
    }

    /// Evict all dispatch and progress state of a queue which is no longer consumed.
    async fn release_queue(&mut self, queue: &QueueHandle) {
        self.ctx.dispatcher.remove_queue(queue).await;
        self.tracker.remove(queue).await;
        tracing::debug!(%queue, "queue consumption stopped");
    }
}
