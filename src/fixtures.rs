use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tracing_subscriber::prelude::*;

use crate::config::ConsumerConfig;
use crate::dispatch::DispatchShared;
use crate::flow::FlowController;
use crate::handler::{ConcurrentHandler, ConsumeContext, DeadLetterSink, OrderlyHandler};
use crate::message::{ConsumeOutcome, PulledMessage, QueueHandle};
use crate::offset::{MemoryOffsetStore, SharedProgress};
use crate::transport::Transport;

/// Install a tracing subscriber for tests, filtered by `RUST_LOG`.
pub fn setup_tracing() {
    let _res = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// A config with short delays suitable for tests.
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        core_pool_size: 4,
        poll_timeout_ms: 200,
        suspend_delay_ms: 10,
        flow_control_delay_ms: 10,
        pull_backoff_initial_ms: 10,
        pull_backoff_max_ms: 50,
        retry_delay_initial_ms: 10,
        retry_delay_max_ms: 50,
        suspend_queue_ms: 50,
        commit_interval_ms: 20,
        shutdown_grace_ms: 1_000,
        ..Default::default()
    }
}

/// Build dispatcher shared state for the given config.
pub fn dispatch_shared(config: ConsumerConfig, dead_letters: Arc<dyn DeadLetterSink>) -> Arc<DispatchShared> {
    let flow = Arc::new(FlowController::new(config.core_pool_size));
    Arc::new(DispatchShared::new(Arc::new(config), flow, dead_letters))
}

pub fn queue(id: u32) -> QueueHandle {
    QueueHandle::new("orders", id, "broker-a")
}

/// Build a message on the given queue.
pub fn message(queue: &QueueHandle, offset: u64) -> PulledMessage {
    PulledMessage::new(queue.clone(), offset, format!("payload-{}", offset))
}

/// Poll the given check until it passes or the timeout elapses.
pub async fn eventually<F>(within: Duration, what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(within, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .with_context(|| format!("timeout waiting for {}", what))
}

/// The committable offset of the given progress, or `None` if it is currently locked.
pub fn committable(progress: &SharedProgress) -> Option<u64> {
    progress.try_lock().ok().and_then(|progress| progress.committable())
}

/// Wait until the given store holds the expected offset for the given queue.
pub async fn wait_for_commit(store: &MemoryOffsetStore, queue: &QueueHandle, expected: u64, within: Duration) -> Result<()> {
    let wait = async {
        while store.stored(queue).await != Some(expected) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .with_context(|| format!("timeout waiting for offset {} of {} to be committed", expected, queue))
}

/// An in-memory broker implementing long-polling fetches.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<QueueHandle, BTreeMap<u64, PulledMessage>>>,
    appended: Notify,
    failures: AtomicUsize,
    pulls: AtomicUsize,
}

impl MemoryBroker {
    /// Append the given message at its own offset.
    pub fn publish(&self, msg: PulledMessage) {
        self.queues
            .lock()
            .expect("broker lock poisoned")
            .entry(msg.queue.clone())
            .or_default()
            .insert(msg.offset, msg);
        self.appended.notify_waiters();
    }

    /// Fail the next `count` pulls with a transport error.
    pub fn fail_next_pulls(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// The number of pulls served so far, including failed ones.
    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn read(&self, queue: &QueueHandle, from_offset: u64, max_batch: u32) -> Vec<PulledMessage> {
        let queues = self.queues.lock().expect("broker lock poisoned");
        queues
            .get(queue)
            .map(|msgs| msgs.range(from_offset..).take(max_batch as usize).map(|(_, msg)| msg.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn pull(&self, queue: &QueueHandle, from_offset: u64, max_batch: u32, max_wait: Duration) -> Result<Vec<PulledMessage>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1)).is_ok() {
            bail!("injected transport failure");
        }
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let appended = self.appended.notified();
            let batch = self.read(queue, from_offset, max_batch);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(vec![]);
            }
        }
    }

    async fn max_offset(&self, queue: &QueueHandle) -> Result<u64> {
        let queues = self.queues.lock().expect("broker lock poisoned");
        Ok(queues.get(queue).and_then(|msgs| msgs.keys().next_back()).map(|offset| offset + 1).unwrap_or(0))
    }
}

type Script = Box<dyn Fn(&[PulledMessage], &mut ConsumeContext) -> Result<ConsumeOutcome> + Send + Sync>;

/// A handler which records every delivery and answers according to a script.
pub struct RecordingHandler {
    script: Script,
    gate: Option<Semaphore>,
    deliveries: Mutex<Vec<PulledMessage>>,
    batches: Mutex<Vec<Vec<u64>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingHandler {
    /// A handler which always succeeds.
    pub fn new() -> Self {
        Self::with_script(|_, _| Ok(ConsumeOutcome::Success))
    }

    /// A handler which answers with the given script.
    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(&[PulledMessage], &mut ConsumeContext) -> Result<ConsumeOutcome> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            gate: None,
            deliveries: Mutex::new(vec![]),
            batches: Mutex::new(vec![]),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Block every invocation until released with `release`.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Allow `count` blocked invocations to finish.
    pub fn release(&self, count: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(count);
        }
    }

    pub fn deliveries(&self) -> Vec<PulledMessage> {
        self.deliveries.lock().expect("handler lock poisoned").clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().expect("handler lock poisoned").len()
    }

    pub fn delivered_offsets(&self) -> Vec<u64> {
        self.deliveries().iter().map(|msg| msg.offset).collect()
    }

    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.batches.lock().expect("handler lock poisoned").clone()
    }

    /// The number of invocations currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The highest number of concurrently running invocations since the last reset.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn reset_max_active(&self) {
        self.max_active.store(self.active(), Ordering::SeqCst);
    }

    async fn handle(&self, msgs: &[PulledMessage], ctx: &mut ConsumeContext) -> Result<ConsumeOutcome> {
        self.deliveries.lock().expect("handler lock poisoned").extend(msgs.iter().cloned());
        self.batches
            .lock()
            .expect("handler lock poisoned")
            .push(msgs.iter().map(|msg| msg.offset).collect());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.context("handler gate closed")?.forget();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.script)(msgs, ctx)
    }
}

#[async_trait]
impl ConcurrentHandler for RecordingHandler {
    async fn consume(&self, msgs: &[PulledMessage], ctx: &mut ConsumeContext) -> Result<ConsumeOutcome> {
        self.handle(msgs, ctx).await
    }
}

#[async_trait]
impl OrderlyHandler for RecordingHandler {
    async fn consume(&self, msgs: &[PulledMessage], ctx: &mut ConsumeContext) -> Result<ConsumeOutcome> {
        self.handle(msgs, ctx).await
    }
}

/// A dead-letter sink which records every message it receives.
#[derive(Default)]
pub struct RecordingDeadLetterSink {
    received: Mutex<Vec<(PulledMessage, String)>>,
}

impl RecordingDeadLetterSink {
    pub fn received(&self) -> Vec<(PulledMessage, String)> {
        self.received.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetterSink {
    async fn dead_letter(&self, msg: &PulledMessage, reason: &str) -> Result<()> {
        self.received.lock().expect("sink lock poisoned").push((msg.clone(), reason.to_string()));
        Ok(())
    }
}
