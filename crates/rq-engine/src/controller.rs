//! The controller seam: application logic reacting to queue lifecycle
//! events, plus the redispatch helper implementing the required retry
//! contract for failed dispatches.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rq_common::{EndpointAddress, QueueItem};

use crate::manager::QueueManager;

/// Application callbacks invoked by the queue manager. One controller per
/// queue system; implementations decide what to do with received work and
/// with dispatch outcomes.
#[async_trait]
pub trait QueueController: Send + Sync {
    /// A new item was admitted to the in-queue and is consumer-visible.
    async fn new_in_item(&self, item: QueueItem);

    /// A dispatched out-item completed successfully at the remote peer.
    async fn out_item_done_success(&self, item: QueueItem, response_data: Option<serde_json::Value>);

    /// A dispatched out-item completed with errors at the remote peer.
    async fn out_item_done_failure(&self, item: QueueItem, response_data: Option<serde_json::Value>);

    /// A dispatched out-item was cancelled at the remote peer.
    async fn out_item_done_cancelled(&self, item: QueueItem);

    /// The remote peer cannot complete the item; it should be dispatched
    /// to an alternate destination.
    async fn out_item_relocation_required(&self, item: QueueItem);

    /// Transport-level dispatch failure. The controller must requeue the
    /// item for later redispatch; dropping it loses work.
    async fn unable_to_dispatch_out_item(&self, item: QueueItem);

    /// The remote in-queue reported full. Same requeue contract as
    /// [`QueueController::unable_to_dispatch_out_item`].
    async fn unable_to_dispatch_out_item_queue_full(&self, item: QueueItem) {
        self.unable_to_dispatch_out_item(item).await;
    }

    /// A remote peer requested cancellation of an in-item that is already
    /// checked out; cooperative cancellation is up to the consumer.
    async fn cancel_in_item(&self, item: QueueItem) {
        debug!(item_id = %item.id, "Cancellation of checked-out item ignored by controller");
    }

    /// The synchronization handshake with a peer completed.
    async fn link_established(&self, _address: &EndpointAddress) {}

    /// The link to a peer was lost.
    async fn link_lost(&self, _address: &EndpointAddress) {}

    /// Items found in the in-queue during startup recovery.
    async fn recovered_items_in_in_queue(&self, _items: Vec<QueueItem>) {}

    /// Items found in the out-queue during startup recovery.
    async fn recovered_items_in_out_queue(&self, _items: Vec<QueueItem>) {}
}

/// Local FIFO of items awaiting redispatch, drained by a bounded-interval
/// poll that respects the destination's back-pressure predicates.
pub struct RedispatchQueue {
    address: EndpointAddress,
    pending: Mutex<VecDeque<QueueItem>>,
    running: AtomicBool,
}

impl RedispatchQueue {
    pub fn new(address: EndpointAddress) -> Arc<Self> {
        Arc::new(Self {
            address,
            pending: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
        })
    }

    pub fn push(&self, item: QueueItem) {
        self.pending.lock().push_back(item);
        metrics::counter!("rq_items_parked_for_redispatch").increment(1);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawn the drain loop. Items are redispatched in order whenever the
    /// destination has headroom; the loop polls rather than spinning.
    pub fn start(
        self: &Arc<Self>,
        manager: Arc<QueueManager>,
        poll_interval: Duration,
        refill_delta: u64,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if !queue.running.load(Ordering::SeqCst) || !manager.is_running() {
                    break;
                }

                let Some(destination) = manager.collaboration().destination(&queue.address) else {
                    continue;
                };

                loop {
                    if !destination.has_dispatch_headroom(refill_delta) {
                        break;
                    }
                    let Some(item) = queue.pending.lock().pop_front() else {
                        break;
                    };
                    let item_id = item.id.clone();
                    if let Err(e) = manager
                        .redispatch_queue_item(item.clone(), queue.address.clone())
                        .await
                    {
                        warn!(item_id = %item_id, error = %e, "Redispatch failed, parking item again");
                        queue.pending.lock().push_front(item);
                        break;
                    }
                    debug!(item_id = %item_id, peer = %queue.address, "Item redispatched");
                }
            }
        })
    }
}
