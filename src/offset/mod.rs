//! Offset persistence and tracking.
//!
//! Stored offsets are always the *last fully consumed* offset of a queue, so consumption resumes
//! at the stored value plus one.

mod sled_store;
mod tracker;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::message::QueueHandle;

pub use sled_store::SledOffsetStore;
pub use tracker::{OffsetTracker, QueueProgress, SharedProgress};

/// Persistent storage for consumed offsets.
#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    /// Load the last consumed offset of the given queue, if any has been stored.
    async fn load_offset(&self, queue: &QueueHandle) -> Result<Option<u64>>;

    /// Store the last consumed offset of the given queue.
    async fn commit_offset(&self, queue: &QueueHandle, offset: u64) -> Result<()>;
}

/// Where to start consuming a queue which has no stored offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartingPoint {
    /// The first offset of the queue.
    Beginning,
    /// The next offset written to the queue after consumption starts.
    Latest,
    /// A specific offset.
    Offset(u64),
}

impl Default for StartingPoint {
    fn default() -> Self {
        Self::Latest
    }
}

/// A non-durable offset store.
#[derive(Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<HashMap<QueueHandle, u64>>,
}

impl MemoryOffsetStore {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the stored offset of the given queue without going through the async trait.
    pub async fn stored(&self, queue: &QueueHandle) -> Option<u64> {
        self.offsets.lock().await.get(queue).copied()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn load_offset(&self, queue: &QueueHandle) -> Result<Option<u64>> {
        Ok(self.offsets.lock().await.get(queue).copied())
    }

    async fn commit_offset(&self, queue: &QueueHandle, offset: u64) -> Result<()> {
        self.offsets.lock().await.insert(queue.clone(), offset);
        Ok(())
    }
}
