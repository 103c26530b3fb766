use async_trait::async_trait;
use rq_common::QueueItem;

use crate::Result;

/// Durable mapping of item id to item snapshot.
///
/// Called from within the owning queue's lock scope; implementations must
/// not reenter the queue.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Persist a newly admitted item. Replaces any existing row with the
    /// same id (idempotent redelivery).
    async fn store(&self, item: &QueueItem) -> Result<()>;

    /// Re-persist an item whose fields changed.
    async fn update(&self, item: &QueueItem) -> Result<()>;

    /// Remove an item by id. Removing an unknown id is not an error.
    async fn remove(&self, item_id: &str) -> Result<()>;

    /// Load all persisted items in admission order, for startup recovery.
    async fn load_all(&self) -> Result<Vec<QueueItem>>;

    /// False for backends that discard everything (recovery is skipped).
    fn is_persistent(&self) -> bool {
        true
    }
}

/// No-op storage for ephemeral queues.
pub struct NullQueueStorage;

#[async_trait]
impl QueueStorage for NullQueueStorage {
    async fn store(&self, _item: &QueueItem) -> Result<()> {
        Ok(())
    }

    async fn update(&self, _item: &QueueItem) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _item_id: &str) -> Result<()> {
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<QueueItem>> {
        Ok(Vec::new())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
