//! The queue itself: a named, lockable container of queue items indexed by
//! insertion order, id and status, with blocking discovery primitives.
//!
//! Every mutating operation is reflected to storage before the in-memory
//! change becomes visible to consumers (write-then-link). The index lock is
//! exposed through [`Queue::lock`] together with `*_locked` variants of the
//! mutating operations, so callers can compose multi-step atomic sequences.

use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, warn};

use rq_common::{QueueItem, QueueItemStatus};

use crate::{QueueError, QueueStorage, Result};

/// The index state guarded by the queue lock.
pub struct QueueIndex {
    /// All items, in admission order.
    items: IndexMap<String, QueueItem>,
    /// Ids of QUEUED items visible to consumers, in admission order.
    queued: VecDeque<String>,
}

impl QueueIndex {
    fn new() -> Self {
        Self {
            items: IndexMap::new(),
            queued: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.items.contains_key(item_id)
    }

    pub fn get(&self, item_id: &str) -> Option<&QueueItem> {
        self.items.get(item_id)
    }

    /// Earliest-admitted QUEUED item, if any.
    pub fn first_queued(&self) -> Option<&QueueItem> {
        self.queued.front().and_then(|id| self.items.get(id))
    }

    /// Snapshot of the QUEUED bucket in admission order.
    pub fn all_queued(&self) -> Vec<QueueItem> {
        self.queued
            .iter()
            .filter_map(|id| self.items.get(id).cloned())
            .collect()
    }

    /// Snapshot of all items with the given status, in admission order.
    pub fn all_with_status(&self, status: QueueItemStatus) -> Vec<QueueItem> {
        self.items
            .values()
            .filter(|item| item.status == status)
            .cloned()
            .collect()
    }

    /// Snapshot of every item, in admission order.
    pub fn all_items(&self) -> Vec<QueueItem> {
        self.items.values().cloned().collect()
    }

    fn link(&mut self, item: QueueItem, consumer_visible: bool) {
        let id = item.id.clone();
        let queued = item.status == QueueItemStatus::Queued;
        self.items.insert(id.clone(), item);
        if queued && consumer_visible && !self.queued.contains(&id) {
            self.queued.push_back(id);
        }
    }

    fn unlink(&mut self, item_id: &str) -> Option<QueueItem> {
        self.queued.retain(|id| id != item_id);
        self.items.shift_remove(item_id)
    }

    fn set_status(&mut self, item_id: &str, status: QueueItemStatus) -> Option<QueueItem> {
        let item = self.items.get_mut(item_id)?;
        let was_queued = item.status == QueueItemStatus::Queued;
        item.status = status;
        let now_queued = status == QueueItemStatus::Queued;

        if was_queued && !now_queued {
            self.queued.retain(|id| id != item_id);
        } else if now_queued && !was_queued && !self.queued.contains(&item_id.to_string()) {
            self.queued.push_back(item_id.to_string());
        }
        Some(item.clone())
    }
}

/// Thread-safe store of queue items with blocking wait/checkout semantics
/// and persistence pass-through.
pub struct Queue {
    name: String,
    max_length: Option<usize>,
    storage: Arc<dyn QueueStorage>,
    index: Mutex<QueueIndex>,
    queued_notify: Notify,
    running: AtomicBool,
}

impl Queue {
    pub fn new(name: impl Into<String>, storage: Arc<dyn QueueStorage>) -> Self {
        Self {
            name: name.into(),
            max_length: None,
            storage,
            index: Mutex::new(QueueIndex::new()),
            queued_notify: Notify::new(),
            running: AtomicBool::new(true),
        }
    }

    pub fn with_max_length(mut self, max_length: Option<usize>) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    pub fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    /// Acquire the index lock. Combined with the `*_locked` operations this
    /// lets callers compose multi-step atomic sequences (check capacity,
    /// look up, then admit, without another task interleaving).
    pub async fn lock(&self) -> MutexGuard<'_, QueueIndex> {
        self.index.lock().await
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Persist and admit an item. A QUEUED item becomes consumer-visible
    /// immediately.
    pub async fn add(&self, item: QueueItem) -> Result<()> {
        let mut index = self.index.lock().await;
        self.add_locked(&mut index, item, true).await
    }

    /// Persist and admit an item without making it consumer-visible; pair
    /// with [`Queue::add_to_queued_list`]. Used when an acknowledgement
    /// must be sent between admission and visibility.
    pub async fn add_without_queueing(&self, item: QueueItem) -> Result<()> {
        let mut index = self.index.lock().await;
        self.add_locked(&mut index, item, false).await
    }

    /// Locked variant of [`Queue::add`]. Storage is written first; on
    /// storage failure the index is untouched.
    pub async fn add_locked(
        &self,
        index: &mut QueueIndex,
        item: QueueItem,
        consumer_visible: bool,
    ) -> Result<()> {
        if let Some(max) = self.max_length {
            if index.len() >= max {
                return Err(QueueError::Full);
            }
        }
        self.storage.store(&item).await?;
        let notify = consumer_visible && item.status == QueueItemStatus::Queued;
        index.link(item, consumer_visible);
        if notify {
            self.queued_notify.notify_waiters();
        }
        Ok(())
    }

    /// Make a previously admitted item visible to consumers.
    pub async fn add_to_queued_list(&self, item_id: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        let item = index
            .items
            .get(item_id)
            .ok_or_else(|| QueueError::NotFound(item_id.to_string()))?;
        if item.status != QueueItemStatus::Queued {
            return Ok(());
        }
        if !index.queued.contains(&item_id.to_string()) {
            index.queued.push_back(item_id.to_string());
            self.queued_notify.notify_waiters();
        }
        Ok(())
    }

    /// Batched admission. Items become visible one by one; a storage
    /// failure stops the batch but corrupts no index.
    pub async fn add_all(&self, items: Vec<QueueItem>) -> Result<()> {
        let mut index = self.index.lock().await;
        for item in items {
            self.add_locked(&mut index, item, true).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blocking discovery
    // ------------------------------------------------------------------

    /// Wait until a QUEUED item exists, then atomically move the
    /// earliest-admitted one to CHECKED_OUT and return it.
    ///
    /// Returns [`QueueError::Interrupted`] when the queue is shut down
    /// while waiting.
    pub async fn check_out_first(&self) -> Result<QueueItem> {
        loop {
            let notified = self.queued_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.running.load(Ordering::SeqCst) {
                return Err(QueueError::Interrupted);
            }

            {
                let mut index = self.index.lock().await;
                if let Some(id) = index.queued.pop_front() {
                    match self.check_out_by_id(&mut index, &id).await {
                        Ok(item) => return Ok(item),
                        Err(e) => {
                            // Roll back visibility so the item is not lost.
                            index.queued.push_front(id);
                            return Err(e);
                        }
                    }
                }
            }

            notified.await;
        }
    }

    async fn check_out_by_id(&self, index: &mut QueueIndex, id: &str) -> Result<QueueItem> {
        let item = index
            .items
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let previous = item.status;
        item.status = QueueItemStatus::CheckedOut;
        let snapshot = item.clone();

        if let Err(e) = self.storage.update(&snapshot).await {
            if let Some(item) = index.items.get_mut(id) {
                item.status = previous;
            }
            return Err(e);
        }

        debug!(queue = %self.name, item_id = %snapshot.id, "Item checked out");
        Ok(snapshot)
    }

    /// Non-blocking checkout of a specific item. Returns false if the item
    /// is not currently QUEUED.
    pub async fn check_out(&self, item_id: &str) -> Result<bool> {
        let mut index = self.index.lock().await;
        if !index.queued.contains(&item_id.to_string()) {
            return Ok(false);
        }
        index.queued.retain(|id| id != item_id);
        match self.check_out_by_id(&mut index, item_id).await {
            Ok(_) => Ok(true),
            Err(e) => {
                index.queued.push_front(item_id.to_string());
                Err(e)
            }
        }
    }

    /// Wait until a QUEUED item exists and return a copy of the earliest
    /// one without checking it out.
    pub async fn get_first(&self) -> Result<QueueItem> {
        loop {
            let notified = self.queued_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.running.load(Ordering::SeqCst) {
                return Err(QueueError::Interrupted);
            }

            {
                let index = self.index.lock().await;
                if let Some(item) = index.first_queued() {
                    return Ok(item.clone());
                }
            }

            notified.await;
        }
    }

    /// Copy of the earliest QUEUED item, if any, without waiting.
    pub async fn get_first_if_any(&self) -> Option<QueueItem> {
        let index = self.index.lock().await;
        index.first_queued().cloned()
    }

    /// Wait up to `timeout` for the QUEUED bucket to become non-empty.
    /// Returns true if it is non-empty on return.
    pub async fn wait_for_queued_items(&self, timeout: Duration) -> Result<bool> {
        let wait = async {
            loop {
                let notified = self.queued_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !self.running.load(Ordering::SeqCst) {
                    return Err(QueueError::Interrupted);
                }
                if self.index.lock().await.queued_len() > 0 {
                    return Ok(true);
                }

                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Ok(self.index.lock().await.queued_len() > 0),
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Remove an item from all indices and storage.
    pub async fn remove(&self, item_id: &str) -> Result<Option<QueueItem>> {
        let mut index = self.index.lock().await;
        self.remove_locked(&mut index, item_id).await
    }

    /// Locked variant of [`Queue::remove`].
    pub async fn remove_locked(
        &self,
        index: &mut QueueIndex,
        item_id: &str,
    ) -> Result<Option<QueueItem>> {
        if !index.contains(item_id) {
            return Ok(None);
        }
        self.storage.remove(item_id).await?;
        Ok(index.unlink(item_id))
    }

    /// Move an item to a new status bucket and persist the change.
    /// Transitioning to QUEUED makes the item consumer-visible again.
    pub async fn force_status(&self, item_id: &str, status: QueueItemStatus) -> Result<QueueItem> {
        let mut index = self.index.lock().await;
        self.force_status_locked(&mut index, item_id, status).await
    }

    /// Locked variant of [`Queue::force_status`].
    pub async fn force_status_locked(
        &self,
        index: &mut QueueIndex,
        item_id: &str,
        status: QueueItemStatus,
    ) -> Result<QueueItem> {
        let previous = index
            .get(item_id)
            .map(|item| item.status)
            .ok_or_else(|| QueueError::NotFound(item_id.to_string()))?;

        let updated = match index.set_status(item_id, status) {
            Some(item) => item,
            None => return Err(QueueError::NotFound(item_id.to_string())),
        };

        if let Err(e) = self.storage.update(&updated).await {
            index.set_status(item_id, previous);
            return Err(e);
        }

        if status == QueueItemStatus::Queued {
            self.queued_notify.notify_waiters();
        }
        Ok(updated)
    }

    /// Re-persist an item whose non-status fields changed, and refresh the
    /// in-memory copy.
    pub async fn update_persistent_storage(&self, item: &QueueItem) -> Result<()> {
        let mut index = self.index.lock().await;
        self.update_persistent_storage_locked(&mut index, item).await
    }

    /// Locked variant of [`Queue::update_persistent_storage`].
    pub async fn update_persistent_storage_locked(
        &self,
        index: &mut QueueIndex,
        item: &QueueItem,
    ) -> Result<()> {
        self.storage.update(item).await?;
        if let Some(existing) = index.items.get_mut(&item.id) {
            let was_queued = existing.status == QueueItemStatus::Queued;
            *existing = item.clone();
            let now_queued = item.status == QueueItemStatus::Queued;
            if was_queued && !now_queued {
                index.queued.retain(|id| id != &item.id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }

    pub async fn queued_len(&self) -> usize {
        self.index.lock().await.queued_len()
    }

    pub async fn is_full(&self) -> bool {
        match self.max_length {
            Some(max) => self.index.lock().await.len() >= max,
            None => false,
        }
    }

    pub async fn contains(&self, item_id: &str) -> bool {
        self.index.lock().await.contains(item_id)
    }

    pub async fn get(&self, item_id: &str) -> Option<QueueItem> {
        self.index.lock().await.get(item_id).cloned()
    }

    pub async fn all_queued(&self) -> Vec<QueueItem> {
        self.index.lock().await.all_queued()
    }

    pub async fn all_with_status(&self, status: QueueItemStatus) -> Vec<QueueItem> {
        self.index.lock().await.all_with_status(status)
    }

    pub async fn all_items(&self) -> Vec<QueueItem> {
        self.index.lock().await.all_items()
    }

    // ------------------------------------------------------------------
    // Recovery and shutdown
    // ------------------------------------------------------------------

    /// Repopulate the indices from storage, preserving persisted statuses
    /// and admission order. Returns the number of items restored.
    pub async fn restore(&self) -> Result<usize> {
        if !self.storage.is_persistent() {
            return Ok(0);
        }

        let items = self.storage.load_all().await?;
        let mut index = self.index.lock().await;
        let count = items.len();

        for item in items {
            index.link(item, true);
        }

        if index.queued_len() > 0 {
            self.queued_notify.notify_waiters();
        }

        if count > 0 {
            warn!(queue = %self.name, count, "Restored persisted queue items");
        }
        Ok(count)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown: wakes all blocked waiters, which then observe
    /// the stopped flag and return [`QueueError::Interrupted`].
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queued_notify.notify_waiters();
    }
}
