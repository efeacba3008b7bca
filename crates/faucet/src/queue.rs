//! Durable queue of recipients awaiting the next batch

use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Batch, Db, Tree};
use std::fmt;
use tracing::debug;

/// Identity of one queued entry. Allocated from a monotonic counter, so key
/// order is insertion order and two entries for the same address never share
/// an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl EntryId {
    fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    fn from_key(key: &[u8]) -> FaucetResult<Self> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| FaucetError::Serialization("Invalid queue key length".to_string()))?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    address: String,
    enqueued_at: i64,
}

/// A pending recipient as read back from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: EntryId,
    /// Exactly what the client submitted
    pub address: String,
    /// Unix seconds
    pub enqueued_at: i64,
}

/// Persisted FIFO of pending recipients.
///
/// Duplicates are legal and each is paid on its own; removal goes by
/// [`EntryId`] rather than by address for that reason.
#[derive(Clone)]
pub struct DurableQueue {
    db: Db,
    tree: Tree,
}

impl DurableQueue {
    pub(crate) fn new(db: Db, tree: Tree) -> Self {
        Self { db, tree }
    }

    /// Append an address. Returns once the entry is flushed to disk.
    pub async fn enqueue(&self, address: &str) -> FaucetResult<EntryId> {
        let db = self.db.clone();
        let tree = self.tree.clone();
        let value = bincode::serialize(&StoredEntry {
            address: address.to_string(),
            enqueued_at: Utc::now().timestamp(),
        })?;

        let id = tokio::task::spawn_blocking(move || -> FaucetResult<EntryId> {
            let id = EntryId(db.generate_id()?);
            tree.insert(id.to_key(), value)?;
            Ok(id)
        })
        .await??;

        self.tree.flush_async().await?;
        debug!("Queued {} as entry {}", address, id);
        Ok(id)
    }

    /// All pending entries in insertion order.
    ///
    /// Entries enqueued while the scan runs may or may not be included; those
    /// that are included carry their own ids, so removing the snapshot never
    /// touches anything it did not return.
    pub async fn snapshot(&self) -> FaucetResult<Vec<QueueEntry>> {
        let tree = self.tree.clone();

        tokio::task::spawn_blocking(move || {
            tree.iter()
                .map(|item| -> FaucetResult<QueueEntry> {
                    let (key, value) = item?;
                    let stored: StoredEntry = bincode::deserialize(&value)?;
                    Ok(QueueEntry {
                        id: EntryId::from_key(&key)?,
                        address: stored.address,
                        enqueued_at: stored.enqueued_at,
                    })
                })
                .collect()
        })
        .await?
    }

    /// Remove exactly the given entries in one atomic batch. Ids that are
    /// already gone are ignored.
    pub async fn remove_all(&self, ids: &[EntryId]) -> FaucetResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let tree = self.tree.clone();
        let mut batch = Batch::default();
        for id in ids {
            batch.remove(id.to_key().to_vec());
        }

        tokio::task::spawn_blocking(move || tree.apply_batch(batch)).await??;
        self.tree.flush_async().await?;

        debug!("Removed {} entries from the queue", ids.len());
        Ok(())
    }

    /// Number of pending entries, counted off the async worker
    pub async fn count(&self) -> FaucetResult<usize> {
        let tree = self.tree.clone();
        Ok(tokio::task::spawn_blocking(move || tree.len()).await?)
    }

    /// Number of pending entries. Walks the whole tree on the calling
    /// thread; async paths use [`DurableQueue::count`].
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// The queue operations a dispatch cycle relies on
#[async_trait]
pub trait PendingEntries: Send + Sync {
    async fn snapshot(&self) -> FaucetResult<Vec<QueueEntry>>;

    async fn remove_all(&self, ids: &[EntryId]) -> FaucetResult<()>;

    async fn count(&self) -> FaucetResult<usize>;
}

#[async_trait]
impl PendingEntries for DurableQueue {
    async fn snapshot(&self) -> FaucetResult<Vec<QueueEntry>> {
        DurableQueue::snapshot(self).await
    }

    async fn remove_all(&self, ids: &[EntryId]) -> FaucetResult<()> {
        DurableQueue::remove_all(self, ids).await
    }

    async fn count(&self) -> FaucetResult<usize> {
        DurableQueue::count(self).await
    }
}
