//! Flow control.
//!
//! Consumer-wide suspension and the resizable worker pool which bounds concurrent handler
//! invocations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::error::{ConsumerError, Result};
use crate::METRIC_CORE_POOL_SIZE;

/// A point-in-time snapshot of the consumer's flow state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowState {
    /// While set, no new fetches are issued and no new work is dispatched.
    pub suspended: bool,
    /// The current size of the worker pool.
    pub core_pool_size: usize,
}

/// Controls consumer suspension and the worker pool size.
pub struct FlowController {
    state_tx: watch::Sender<FlowState>,
    state_rx: watch::Receiver<FlowState>,
    pool: WorkerPool,
}

impl FlowController {
    /// Create a new instance with the given initial pool size.
    pub fn new(core_pool_size: usize) -> Self {
        let (state_tx, state_rx) = watch::channel(FlowState {
            suspended: false,
            core_pool_size,
        });
        metrics::gauge!(METRIC_CORE_POOL_SIZE, core_pool_size as f64);
        Self {
            state_tx,
            state_rx,
            pool: WorkerPool::new(core_pool_size),
        }
    }

    /// Suspend consumption; in-flight handler invocations are not interrupted.
    pub fn suspend(&self) {
        self.state_tx.send_modify(|state| state.suspended = true);
        tracing::debug!("consumer suspended");
    }

    /// Resume consumption.
    pub fn resume(&self) {
        self.state_tx.send_modify(|state| state.suspended = false);
        tracing::debug!("consumer resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.state_rx.borrow().suspended
    }

    /// Wait until the consumer is not suspended, resolving immediately if it already isn't.
    pub async fn wait_resumed(&self) {
        let mut state = self.state_rx.clone();
        loop {
            if !state.borrow_and_update().suspended {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn snapshot(&self) -> FlowState {
        *self.state_rx.borrow()
    }

    /// Resize the worker pool; effective for newly scheduled work only.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn update_core_pool_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(ConsumerError::InvalidArgument("core pool size must be greater than 0".into()));
        }
        self.pool.resize(size);
        self.state_tx.send_modify(|state| state.core_pool_size = size);
        metrics::gauge!(METRIC_CORE_POOL_SIZE, size as f64);
        Ok(())
    }

    /// The worker pool governed by this controller.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

/// A resizable pool of worker permits.
///
/// Shrinking never preempts in-flight work: permits which cannot be reclaimed immediately are
/// recorded as debt and forgotten as their holders release them.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    semaphore: Arc<Semaphore>,
    /// The target pool size, guarded so resizes are serialized.
    size: Mutex<usize>,
    /// Permits to forget instead of release.
    debt: AtomicUsize,
}

impl WorkerPool {
    /// Create a new instance.
    pub fn new(size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(size)),
                size: Mutex::new(size),
                debt: AtomicUsize::new(0),
            }),
        }
    }

    /// Acquire a worker permit, waiting for one to become available.
    ///
    /// Returns `None` once the pool has been closed.
    pub async fn acquire(&self) -> Option<PoolPermit> {
        let permit = self.inner.semaphore.clone().acquire_owned().await.ok()?;
        Some(PoolPermit {
            permit: Some(permit),
            pool: self.inner.clone(),
        })
    }

    /// The target size of the pool.
    pub fn size(&self) -> usize {
        match self.inner.size.lock() {
            Ok(size) => *size,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// The number of permits which may currently be acquired without waiting.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Close the pool, waking every waiter with `None`.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }

    pub(crate) fn resize(&self, new_size: usize) {
        let mut size = match self.inner.size.lock() {
            Ok(size) => size,
            Err(poisoned) => poisoned.into_inner(),
        };
        let current = *size;
        if new_size > current {
            let grow = new_size - current;
            let paid = self.inner.pay_debt(grow);
            self.inner.semaphore.add_permits(grow - paid);
        } else if new_size < current {
            let mut shrink = current - new_size;
            while shrink > 0 {
                match self.inner.semaphore.clone().try_acquire_owned() {
                    Ok(permit) => {
                        permit.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            self.inner.debt.fetch_add(shrink, Ordering::SeqCst);
        }
        *size = new_size;
        tracing::debug!(from = current, to = new_size, debt = self.inner.debt.load(Ordering::SeqCst), "worker pool resized");
    }
}

impl PoolInner {
    /// Cancel up to `max` units of debt, returning the amount cancelled.
    fn pay_debt(&self, max: usize) -> usize {
        let mut paid = 0;
        let _res = self.debt.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |debt| {
            paid = debt.min(max);
            Some(debt - paid)
        });
        paid
    }
}

/// A worker permit; released back to the pool on drop unless the pool has shrunk.
pub struct PoolPermit {
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if self.pool.pay_debt(1) == 1 {
                permit.forget();
            }
        }
    }
}
