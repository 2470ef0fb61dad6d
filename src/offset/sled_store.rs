use std::convert::TryFrom;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sled::{Config as SledConfig, Tree};

use super::OffsetStore;
use crate::message::QueueHandle;

/// The DB tree holding consumer offsets.
const TREE_OFFSETS: &str = "consumer_offsets";
/// The key prefix used for queue offsets.
const PREFIX_QUEUE_OFFSET: &str = "o";
const ERR_DB_FLUSH: &str = "error flushing consumer offsets to disk";

/// A durable offset store backed by a local sled database.
#[derive(Clone)]
pub struct SledOffsetStore {
    tree: Tree,
}

impl SledOffsetStore {
    /// Open the offset store at the given path, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&path)
            .await
            .context("error creating dir for consumer offset database")?;
        let tree = tokio::task::spawn_blocking(move || -> Result<Tree> {
            let db = SledConfig::new().path(path).mode(sled::Mode::HighThroughput).open()?;
            Ok(db.open_tree(TREE_OFFSETS)?)
        })
        .await
        .context("error joining offset store open task")?
        .context("error opening consumer offset database")?;
        Ok(Self { tree })
    }

    /// Build the storage key of the given queue.
    fn key(queue: &QueueHandle) -> String {
        format!("{}{}/{}/{}", PREFIX_QUEUE_OFFSET, queue.topic, queue.broker, queue.queue_id)
    }

    fn decode_u64(data: &[u8]) -> Result<u64> {
        match <[u8; 8]>::try_from(data) {
            Ok(bytes) => Ok(u64::from_be_bytes(bytes)),
            Err(_) => bail!("stored offset has invalid length {}", data.len()),
        }
    }
}

#[async_trait]
impl OffsetStore for SledOffsetStore {
    #[tracing::instrument(level = "trace", skip(self), fields(queue = %queue))]
    async fn load_offset(&self, queue: &QueueHandle) -> Result<Option<u64>> {
        let val = self.tree.get(Self::key(queue)).context("error reading queue offset from disk")?;
        val.map(|ivec| Self::decode_u64(&ivec)).transpose()
    }

    #[tracing::instrument(level = "trace", skip(self), fields(queue = %queue))]
    async fn commit_offset(&self, queue: &QueueHandle, offset: u64) -> Result<()> {
        self.tree
            .insert(Self::key(queue), &offset.to_be_bytes())
            .context("error updating queue offset on disk")?;
        self.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }
}
