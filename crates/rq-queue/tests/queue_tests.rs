//! Queue unit tests
//!
//! Tests for:
//! - Blocking checkout and wake-on-add
//! - FIFO checkout order
//! - Status bucket exclusivity
//! - Write-then-link persistence ordering
//! - Shutdown waking blocked waiters
//! - SQLite-backed restore

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rq_common::{ItemData, QueueItem, QueueItemStatus};
use rq_queue::{NullQueueStorage, Queue, QueueError, QueueStorage, SqliteQueueStorage};

/// Storage mock that can be switched into a failing mode and counts calls.
struct MockStorage {
    fail: AtomicBool,
    store_calls: AtomicU32,
    update_calls: AtomicU32,
}

impl MockStorage {
    fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            store_calls: AtomicU32::new(0),
            update_calls: AtomicU32::new(0),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueStorage for MockStorage {
    async fn store(&self, _item: &QueueItem) -> rq_queue::Result<()> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("mock store failure".into()));
        }
        Ok(())
    }

    async fn update(&self, _item: &QueueItem) -> rq_queue::Result<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("mock update failure".into()));
        }
        Ok(())
    }

    async fn remove(&self, _item_id: &str) -> rq_queue::Result<()> {
        Ok(())
    }

    async fn load_all(&self) -> rq_queue::Result<Vec<QueueItem>> {
        Ok(Vec::new())
    }
}

fn test_item(description: &str) -> QueueItem {
    QueueItem::new(ItemData::new(
        description,
        serde_json::json!({ "job": description }),
    ))
}

#[tokio::test]
async fn check_out_first_returns_queued_item() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let item = test_item("a");
    let id = item.id.clone();
    queue.add(item).await.unwrap();

    let checked_out = queue.check_out_first().await.unwrap();
    assert_eq!(checked_out.id, id);
    assert_eq!(checked_out.status, QueueItemStatus::CheckedOut);
    assert_eq!(queue.queued_len().await, 0);
    // Still present in the queue, just no longer consumer-visible
    assert!(queue.contains(&id).await);
}

#[tokio::test]
async fn blocked_checkout_wakes_on_add() {
    let queue = Arc::new(Queue::new("in", Arc::new(NullQueueStorage)));

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.check_out_first().await })
    };

    // Give the waiter time to block on the empty queue
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    let item = test_item("wake");
    let id = item.id.clone();
    queue.add(item).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should wake")
        .unwrap();
    assert_eq!(result.unwrap().id, id);
}

#[tokio::test]
async fn checkout_order_is_fifo() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let mut ids = Vec::new();
    for i in 0..5 {
        let item = test_item(&format!("job-{}", i));
        ids.push(item.id.clone());
        queue.add(item).await.unwrap();
    }

    for expected in &ids {
        let item = queue.check_out_first().await.unwrap();
        assert_eq!(&item.id, expected);
    }
}

#[tokio::test]
async fn item_is_in_exactly_one_status_bucket() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let item = test_item("a");
    let id = item.id.clone();
    queue.add(item).await.unwrap();

    assert_eq!(queue.all_with_status(QueueItemStatus::Queued).await.len(), 1);

    queue
        .force_status(&id, QueueItemStatus::Dispatching)
        .await
        .unwrap();

    assert_eq!(queue.all_with_status(QueueItemStatus::Queued).await.len(), 0);
    assert_eq!(queue.queued_len().await, 0);
    assert_eq!(
        queue
            .all_with_status(QueueItemStatus::Dispatching)
            .await
            .len(),
        1
    );
    assert_eq!(queue.len().await, 1);
}

#[tokio::test]
async fn requeue_makes_item_visible_again() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let item = test_item("a");
    let id = item.id.clone();
    queue.add(item).await.unwrap();

    let checked_out = queue.check_out_first().await.unwrap();
    assert_eq!(checked_out.status, QueueItemStatus::CheckedOut);
    assert_eq!(queue.queued_len().await, 0);

    queue.force_status(&id, QueueItemStatus::Queued).await.unwrap();
    assert_eq!(queue.queued_len().await, 1);
    let again = queue.check_out_first().await.unwrap();
    assert_eq!(again.id, id);
}

#[tokio::test]
async fn failed_store_leaves_item_invisible() {
    let storage = Arc::new(MockStorage::new());
    let queue = Queue::new("in", storage.clone());

    storage.set_failing(true);
    let result = queue.add(test_item("a")).await;
    assert!(matches!(result, Err(QueueError::Storage(_))));
    assert_eq!(queue.len().await, 0);
    assert_eq!(queue.queued_len().await, 0);

    // Recovered storage admits normally again
    storage.set_failing(false);
    queue.add(test_item("b")).await.unwrap();
    assert_eq!(queue.len().await, 1);
}

#[tokio::test]
async fn deferred_visibility_admission() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let item = test_item("a");
    let id = item.id.clone();

    queue.add_without_queueing(item).await.unwrap();
    assert!(queue.contains(&id).await);
    assert_eq!(queue.queued_len().await, 0);
    assert!(queue.get_first_if_any().await.is_none());

    queue.add_to_queued_list(&id).await.unwrap();
    assert_eq!(queue.queued_len().await, 1);
    assert_eq!(queue.get_first_if_any().await.unwrap().id, id);
}

#[tokio::test]
async fn shutdown_wakes_blocked_waiters() {
    let queue = Arc::new(Queue::new("in", Arc::new(NullQueueStorage)));

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.check_out_first().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter should wake on shutdown")
        .unwrap();
    assert!(matches!(result, Err(QueueError::Interrupted)));
}

#[tokio::test]
async fn wait_for_queued_items_times_out_on_empty_queue() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let non_empty = queue
        .wait_for_queued_items(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(!non_empty);
}

#[tokio::test]
async fn wait_for_queued_items_sees_concurrent_add() {
    let queue = Arc::new(Queue::new("in", Arc::new(NullQueueStorage)));

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.wait_for_queued_items(Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.add(test_item("a")).await.unwrap();

    let non_empty = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(non_empty);
}

#[tokio::test]
async fn check_out_specific_item() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let a = test_item("a");
    let b = test_item("b");
    let b_id = b.id.clone();
    queue.add(a).await.unwrap();
    queue.add(b).await.unwrap();

    assert!(queue.check_out(&b_id).await.unwrap());
    // Already checked out; a second attempt fails
    assert!(!queue.check_out(&b_id).await.unwrap());
    assert_eq!(queue.queued_len().await, 1);
}

#[tokio::test]
async fn remove_clears_all_indices() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage));
    let item = test_item("a");
    let id = item.id.clone();
    queue.add(item).await.unwrap();

    let removed = queue.remove(&id).await.unwrap();
    assert_eq!(removed.unwrap().id, id);
    assert!(!queue.contains(&id).await);
    assert_eq!(queue.queued_len().await, 0);
    assert!(queue.remove(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn max_length_reports_full_and_rejects_admission() {
    let queue = Queue::new("in", Arc::new(NullQueueStorage)).with_max_length(Some(2));
    assert!(!queue.is_full().await);
    queue.add(test_item("a")).await.unwrap();
    queue.add(test_item("b")).await.unwrap();
    assert!(queue.is_full().await);
    assert!(matches!(
        queue.add(test_item("c")).await,
        Err(QueueError::Full)
    ));
    assert_eq!(queue.len().await, 2);
}

#[tokio::test]
async fn sqlite_restore_preserves_items_and_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queues.db");
    let db_path = db_path.to_str().unwrap();

    let first_id;
    let second_id;
    {
        let storage = Arc::new(SqliteQueueStorage::connect(db_path, "out").await.unwrap());
        let queue = Queue::new("out", storage);

        let mut first = test_item("first");
        first.status = QueueItemStatus::Dispatching;
        first_id = first.id.clone();
        let second = test_item("second");
        second_id = second.id.clone();

        queue.add(first).await.unwrap();
        queue.add(second).await.unwrap();
    }

    // Simulated restart: fresh storage and queue over the same database
    let storage = Arc::new(SqliteQueueStorage::connect(db_path, "out").await.unwrap());
    let queue = Queue::new("out", storage);
    let restored = queue.restore().await.unwrap();
    assert_eq!(restored, 2);

    let first = queue.get(&first_id).await.unwrap();
    assert_eq!(first.status, QueueItemStatus::Dispatching);
    let second = queue.get(&second_id).await.unwrap();
    assert_eq!(second.status, QueueItemStatus::Queued);
    // Only the QUEUED item is consumer-visible
    assert_eq!(queue.queued_len().await, 1);
}

#[tokio::test]
async fn sqlite_remove_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("queues.db");
    let db_path = db_path.to_str().unwrap();

    let id;
    {
        let storage = Arc::new(SqliteQueueStorage::connect(db_path, "out").await.unwrap());
        let queue = Queue::new("out", storage);
        let item = test_item("gone");
        id = item.id.clone();
        queue.add(item).await.unwrap();
        queue.remove(&id).await.unwrap();
    }

    let storage = Arc::new(SqliteQueueStorage::connect(db_path, "out").await.unwrap());
    let queue = Queue::new("out", storage);
    assert_eq!(queue.restore().await.unwrap(), 0);
    assert!(!queue.contains(&id).await);
}
