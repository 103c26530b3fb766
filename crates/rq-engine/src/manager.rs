//! The queue manager: orchestrates the in-queue (work received from peers)
//! and the out-queue (work dispatched to peers) — admission, dispatch,
//! retry, relocation, completion bookkeeping, periodic consistency checks,
//! and the synchronization handshake that gates traffic after (re)connect.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use rq_common::{
    EndpointAddress, ItemData, QueueItem, QueueItemStatus, QueueSystemMetaData, ResponseType,
};
use rq_config::AppConfig;
use rq_protocol::{
    MultiQueueItemTransferRequest, QueueItemCancellationRequest, QueueItemCompletionResponse,
    QueueItemRelocationRequest, QueueItemTransferRequest, QueueItemTransferResponse,
    QueueSystemCommand, QueueSystemSynchronizationRequest, QueueSystemSynchronizationResponse,
    SyncItemStatus,
};
use rq_queue::{Queue, QueueStorage};

use crate::collaboration::CollaborationManager;
use crate::controller::QueueController;
use crate::destination::RemoteQueueSystemDestination;
use crate::transport::MessageTransport;
use crate::{EngineError, Result};

/// A completion response held for later delivery (unsent) or for a
/// resynchronizing peer (recent).
#[derive(Clone)]
struct CachedResponse {
    response: QueueItemCompletionResponse,
    cached_at: DateTime<Utc>,
}

pub struct QueueManager {
    local_address: EndpointAddress,
    config: AppConfig,
    controller: Arc<dyn QueueController>,
    in_queue: Arc<Queue>,
    out_queue: Arc<Queue>,
    collaboration: CollaborationManager,
    /// Coarse lock for composite sequences touching item fields and queue
    /// containment together, so a completion response cannot be applied to
    /// an item mid-dispatch.
    queue_items_lock: Mutex<()>,
    /// Completion responses that could not be delivered, keyed by item id.
    unsent_completion_responses: DashMap<String, CachedResponse>,
    /// Recently delivered completion responses, kept for peers that
    /// resynchronize and ask about items we already answered.
    recent_completion_responses: DashMap<String, CachedResponse>,
    in_queue_blocked: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl QueueManager {
    pub fn new(
        config: AppConfig,
        controller: Arc<dyn QueueController>,
        transport: Arc<dyn MessageTransport>,
        in_storage: Arc<dyn QueueStorage>,
        out_storage: Arc<dyn QueueStorage>,
    ) -> Arc<Self> {
        let local_address = transport.local_address().clone();
        let in_queue = Arc::new(
            Queue::new(format!("{}-in", local_address), in_storage)
                .with_max_length(config.queue.in_queue_max_length.map(|v| v as usize)),
        );
        let out_queue = Arc::new(Queue::new(format!("{}-out", local_address), out_storage));
        let collaboration =
            CollaborationManager::new(transport, config.destination.command_queue_capacity);
        let (shutdown_tx, _) = broadcast::channel(4);

        Arc::new(Self {
            local_address,
            config,
            controller,
            in_queue,
            out_queue,
            collaboration,
            queue_items_lock: Mutex::new(()),
            unsent_completion_responses: DashMap::new(),
            recent_completion_responses: DashMap::new(),
            in_queue_blocked: AtomicBool::new(false),
            running: AtomicBool::new(true),
            shutdown_tx,
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restore persisted state, run the recovery checks, and start the
    /// transport event pump and the maintenance loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let restored_in = self.in_queue.restore().await?;
        let restored_out = self.out_queue.restore().await?;
        if restored_in + restored_out > 0 {
            info!(
                node = %self.local_address,
                restored_in,
                restored_out,
                "Recovered persisted queue items"
            );
        }

        self.perform_in_queue_check().await?;
        self.perform_out_queue_check().await?;

        self.collaboration.start_event_pump(Arc::clone(self));
        tokio::spawn(run_maintenance(
            Arc::clone(self),
            self.shutdown_tx.subscribe(),
        ));

        info!(node = %self.local_address, "Queue manager started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown: stops the maintenance loop, wakes queue
    /// waiters, and destroys the destination workers.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        self.in_queue.shutdown();
        self.out_queue.shutdown();
        self.collaboration.destroy_all().await;
        info!(node = %self.local_address, "Queue manager stopped");
    }

    pub fn local_address(&self) -> &EndpointAddress {
        &self.local_address
    }

    pub fn in_queue(&self) -> &Arc<Queue> {
        &self.in_queue
    }

    pub fn out_queue(&self) -> &Arc<Queue> {
        &self.out_queue
    }

    pub fn collaboration(&self) -> &CollaborationManager {
        &self.collaboration
    }

    pub fn controller(&self) -> &Arc<dyn QueueController> {
        &self.controller
    }

    /// Administratively block or unblock in-queue admission. Blocked
    /// admission answers transfers with a queue-full response.
    pub fn set_in_queue_blocked(&self, blocked: bool) {
        self.in_queue_blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn is_in_queue_blocked(&self) -> bool {
        self.in_queue_blocked.load(Ordering::SeqCst)
    }

    async fn local_meta_data(&self) -> QueueSystemMetaData {
        QueueSystemMetaData::new(
            self.in_queue.len().await as u64,
            self.config.queue.in_queue_max_length,
            self.is_in_queue_blocked(),
        )
    }

    // ------------------------------------------------------------------
    // Dispatch (out-queue side)
    // ------------------------------------------------------------------

    /// Create an out-item for `item_data` and dispatch it to `address`.
    /// Returns the assigned item id immediately; the outcome arrives via
    /// controller callbacks.
    pub async fn dispatch_queue_item(
        self: &Arc<Self>,
        item_data: ItemData,
        address: EndpointAddress,
    ) -> Result<String> {
        self.dispatch_item(QueueItem::new(item_data), address).await
    }

    /// Dispatch a child of a received in-item downstream (relay).
    pub async fn dispatch_queue_item_relay(
        self: &Arc<Self>,
        parent: &QueueItem,
        address: EndpointAddress,
    ) -> Result<String> {
        self.dispatch_item(QueueItem::child_of(parent), address).await
    }

    /// Re-dispatch an existing out-item (after a failure or relocation),
    /// keeping its id.
    pub async fn redispatch_queue_item(
        self: &Arc<Self>,
        item: QueueItem,
        address: EndpointAddress,
    ) -> Result<String> {
        self.dispatch_item(item, address).await
    }

    async fn dispatch_item(
        self: &Arc<Self>,
        mut item: QueueItem,
        address: EndpointAddress,
    ) -> Result<String> {
        if !self.is_running() {
            return Err(EngineError::Shutdown);
        }

        // Item mutation, out-queue containment and command construction
        // are one atomic step with respect to arriving completions.
        let _guard = self.queue_items_lock.lock().await;

        item.increment_dispatch_count();
        item.sender_receiver_address = Some(address.clone());
        item.touch_send_receive_time();
        item.status = QueueItemStatus::Dispatching;
        item.age_warning_count = 0;

        if self.out_queue.contains(&item.id).await {
            self.out_queue.update_persistent_storage(&item).await?;
        } else {
            self.out_queue.add(item.clone()).await?;
        }

        let destination = self
            .collaboration
            .get_or_create_destination(&address, self);
        destination.increment_expected_remote_in_queue_length();

        let command = QueueSystemCommand::Transfer(QueueItemTransferRequest {
            address: address.clone(),
            item: item.clone(),
        });
        destination
            .dispatch_command(command, self, self.collaboration.transport())
            .await;

        metrics::counter!("rq_items_dispatched").increment(1);
        debug!(item_id = %item.id, peer = %address, dispatch_count = item.dispatch_count, "Item dispatched");
        Ok(item.id)
    }

    /// Dispatch a batch of items to one destination as a single transfer
    /// command.
    pub async fn dispatch_queue_items(
        self: &Arc<Self>,
        item_data: Vec<ItemData>,
        address: EndpointAddress,
    ) -> Result<Vec<String>> {
        if !self.is_running() {
            return Err(EngineError::Shutdown);
        }

        let _guard = self.queue_items_lock.lock().await;

        let mut items = Vec::with_capacity(item_data.len());
        for data in item_data {
            let mut item = QueueItem::new(data);
            item.increment_dispatch_count();
            item.sender_receiver_address = Some(address.clone());
            item.touch_send_receive_time();
            item.status = QueueItemStatus::Dispatching;
            self.out_queue.add(item.clone()).await?;
            items.push(item);
        }

        let destination = self
            .collaboration
            .get_or_create_destination(&address, self);
        for _ in &items {
            destination.increment_expected_remote_in_queue_length();
        }

        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let command = QueueSystemCommand::MultiTransfer(MultiQueueItemTransferRequest {
            address: address.clone(),
            items,
        });
        destination
            .dispatch_command(command, self, self.collaboration.transport())
            .await;

        metrics::counter!("rq_items_dispatched").increment(ids.len() as u64);
        Ok(ids)
    }

    /// Whether a burst to `address` may be dispatched right now: link
    /// established and the remote in-queue neither blocked nor estimated
    /// full.
    pub fn can_dispatch_to(&self, address: &EndpointAddress) -> bool {
        match self.collaboration.destination(address) {
            Some(destination) => {
                destination.is_link_established()
                    && !destination.is_remote_in_queue_blocked()
                    && !destination.is_expected_remote_in_queue_full()
            }
            None => false,
        }
    }

    /// Remove an out-item the controller has given up on.
    pub async fn remove_out_item(&self, item_id: &str) -> Result<Option<QueueItem>> {
        let _guard = self.queue_items_lock.lock().await;
        Ok(self.out_queue.remove(item_id).await?)
    }

    pub async fn get_out_item(&self, item_id: &str) -> Option<QueueItem> {
        self.out_queue.get(item_id).await
    }

    pub async fn get_in_item(&self, item_id: &str) -> Option<QueueItem> {
        self.in_queue.get(item_id).await
    }

    // ------------------------------------------------------------------
    // In-queue consumption
    // ------------------------------------------------------------------

    /// Blocking checkout of the next in-item (see [`Queue::check_out_first`]).
    pub async fn check_out_first(&self) -> Result<QueueItem> {
        Ok(self.in_queue.check_out_first().await?)
    }

    /// Non-blocking checkout of a specific in-item. Returns false when the
    /// item is not currently queued.
    pub async fn check_out(&self, item_id: &str) -> Result<bool> {
        Ok(self.in_queue.check_out(item_id).await?)
    }

    /// Report the outcome of a consumed in-item: the item takes its
    /// terminal status and a completion response travels back to the
    /// originating peer.
    pub async fn in_item_done(
        self: &Arc<Self>,
        item: &QueueItem,
        response_type: ResponseType,
        response_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let status = response_type.completion_status().ok_or_else(|| {
            EngineError::Dispatch(format!(
                "{:?} is not a completion response type",
                response_type
            ))
        })?;

        let sender;
        {
            let _guard = self.queue_items_lock.lock().await;
            let Some(existing) = self.in_queue.get(&item.id).await else {
                debug!(item_id = %item.id, "Completion for unknown in-item ignored");
                return Ok(());
            };
            if existing.is_completed() {
                // Last-write-wins: the first completion stands.
                return Ok(());
            }
            sender = existing.sender_receiver_address.clone();

            if self.config.queue.retain_completed_in_items {
                self.in_queue.force_status(&item.id, status).await?;
            } else {
                self.in_queue.remove(&item.id).await?;
            }
        }

        metrics::counter!("rq_in_items_completed").increment(1);

        if let Some(address) = sender {
            let response = QueueItemCompletionResponse {
                address,
                item_id: item.id.clone(),
                response_type,
                response_data,
                meta_data: Some(self.local_meta_data().await),
            };
            self.collaboration
                .dispatch_command(QueueSystemCommand::Completion(response), self)
                .await;
        }
        Ok(())
    }

    pub async fn in_item_done_success(
        self: &Arc<Self>,
        item: &QueueItem,
        response_data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.in_item_done(item, ResponseType::DoneSuccess, response_data)
            .await
    }

    pub async fn in_item_done_failure(
        self: &Arc<Self>,
        item: &QueueItem,
        response_data: Option<serde_json::Value>,
    ) -> Result<()> {
        self.in_item_done(item, ResponseType::DoneFailure, response_data)
            .await
    }

    pub async fn in_item_done_cancelled(self: &Arc<Self>, item: &QueueItem) -> Result<()> {
        self.in_item_done(item, ResponseType::DoneCancelled, None)
            .await
    }

    /// Signal that this system cannot complete a received item and its
    /// originator should relocate it to an alternate destination.
    pub async fn in_item_relocation_required(self: &Arc<Self>, item: &QueueItem) -> Result<()> {
        self.in_item_done(item, ResponseType::RelocationRequired, None)
            .await
    }

    /// Locally cancel a pending in-item. Checked-out items are handed to
    /// the controller for cooperative cancellation.
    pub async fn cancel_in_item(self: &Arc<Self>, item_id: &str) -> Result<bool> {
        let item = {
            let _guard = self.queue_items_lock.lock().await;
            match self.in_queue.get(item_id).await {
                Some(item) if !item.is_completed() => item,
                _ => return Ok(false),
            }
        };

        if item.status == QueueItemStatus::CheckedOut {
            self.controller.cancel_in_item(item).await;
            return Ok(true);
        }

        self.in_item_done_cancelled(&item).await?;
        Ok(true)
    }

    /// Ask the peer holding a dispatched out-item to cancel it.
    pub async fn request_out_item_cancellation(self: &Arc<Self>, item_id: &str) -> Result<()> {
        let item = self
            .out_queue
            .get(item_id)
            .await
            .ok_or_else(|| EngineError::Queue(rq_queue::QueueError::NotFound(item_id.into())))?;
        let address = item
            .sender_receiver_address
            .clone()
            .ok_or_else(|| EngineError::Dispatch("out-item has no destination".into()))?;

        let command = QueueSystemCommand::Cancellation(QueueItemCancellationRequest {
            address,
            item_id: item.id,
        });
        self.collaboration.dispatch_command(command, self).await;
        Ok(())
    }

    /// Ask the peer holding a dispatched out-item to give it back for
    /// relocation.
    pub async fn request_out_item_relocation(self: &Arc<Self>, item_id: &str) -> Result<()> {
        let item = self
            .out_queue
            .get(item_id)
            .await
            .ok_or_else(|| EngineError::Queue(rq_queue::QueueError::NotFound(item_id.into())))?;
        let address = item
            .sender_receiver_address
            .clone()
            .ok_or_else(|| EngineError::Dispatch("out-item has no destination".into()))?;

        let command = QueueSystemCommand::Relocation(QueueItemRelocationRequest {
            address,
            item_id: item.id,
        });
        self.collaboration.dispatch_command(command, self).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound command handling (called from per-peer sequential handlers)
    // ------------------------------------------------------------------

    pub async fn queue_system_command_received(self: &Arc<Self>, command: QueueSystemCommand) {
        metrics::counter!("rq_commands_received").increment(1);

        match command {
            QueueSystemCommand::Transfer(request) => {
                self.queue_item_transfer_request_received(request).await;
            }
            QueueSystemCommand::MultiTransfer(request) => {
                for item in request.items {
                    self.queue_item_transfer_request_received(QueueItemTransferRequest {
                        address: request.address.clone(),
                        item,
                    })
                    .await;
                }
            }
            QueueSystemCommand::TransferResponse(response) => {
                self.apply_piggybacked_meta_data(&response.address, response.meta_data.clone());
                match response.response_type {
                    ResponseType::TransferSuccess => {
                        self.queue_item_transferred(&response.item_id).await;
                    }
                    ResponseType::TransferFailure => {
                        self.queue_item_transfer_failure(&response.item_id).await;
                    }
                    ResponseType::TransferQueueFull => {
                        self.queue_item_transfer_failure_queue_full(&response.item_id)
                            .await;
                    }
                    other => {
                        warn!(response_type = ?other, "Unexpected transfer response type");
                    }
                }
            }
            QueueSystemCommand::Completion(response) => {
                self.apply_piggybacked_meta_data(&response.address, response.meta_data.clone());
                self.apply_completion_response(response).await;
            }
            QueueSystemCommand::Cancellation(request) => {
                self.queue_item_cancellation_request_received(request).await;
            }
            QueueSystemCommand::Relocation(request) => {
                self.queue_item_relocation_request_received(request).await;
            }
            QueueSystemCommand::SyncRequest(request) => {
                self.queue_system_synchronization_request_received(request)
                    .await;
            }
            QueueSystemCommand::SyncResponse(response) => {
                self.queue_system_synchronization_response_received(response)
                    .await;
            }
        }
    }

    fn apply_piggybacked_meta_data(
        &self,
        peer: &EndpointAddress,
        meta_data: Option<QueueSystemMetaData>,
    ) {
        if let (Some(meta), Some(destination)) = (meta_data, self.collaboration.destination(peer)) {
            destination.remote_meta_data_updated(meta);
        }
    }

    /// Admission of a transferred item into the in-queue. Redelivery of a
    /// known id updates persisted state instead of duplicating; a full or
    /// blocked in-queue answers queue-full; the item only becomes
    /// consumer-visible after the acknowledgement is on its way.
    async fn queue_item_transfer_request_received(
        self: &Arc<Self>,
        request: QueueItemTransferRequest,
    ) {
        let peer = request.address.clone();
        let mut item = request.item;
        item.status = QueueItemStatus::Queued;

        let item_id = item.id.clone();
        let mut accepted_new = false;

        let response_type = {
            let mut index = self.in_queue.lock().await;

            if index.contains(&item_id) {
                // Idempotent redelivery: refresh the persisted snapshot,
                // keep the current processing state.
                let mut existing = match index.get(&item_id) {
                    Some(existing) => existing.clone(),
                    None => item.clone(),
                };
                existing.touch_send_receive_time();
                match self
                    .in_queue
                    .update_persistent_storage_locked(&mut index, &existing)
                    .await
                {
                    Ok(()) => {
                        debug!(item_id = %item_id, peer = %peer, "Duplicate transfer updated existing item");
                        ResponseType::TransferSuccess
                    }
                    Err(e) => {
                        warn!(item_id = %item_id, error = %e, "Storage failure on duplicate transfer");
                        ResponseType::TransferFailure
                    }
                }
            } else if self.is_in_queue_blocked()
                || self
                    .in_queue
                    .max_length()
                    .map(|max| index.len() >= max)
                    .unwrap_or(false)
            {
                ResponseType::TransferQueueFull
            } else {
                match self.in_queue.add_locked(&mut index, item.clone(), false).await {
                    Ok(()) => {
                        accepted_new = true;
                        ResponseType::TransferSuccess
                    }
                    Err(e) => {
                        warn!(item_id = %item_id, error = %e, "Storage failure admitting transferred item");
                        ResponseType::TransferFailure
                    }
                }
            }
        };

        let response = QueueSystemCommand::TransferResponse(QueueItemTransferResponse {
            address: peer.clone(),
            item_id: item_id.clone(),
            response_type,
            meta_data: Some(self.local_meta_data().await),
        });
        self.collaboration.dispatch_command(response, self).await;

        if accepted_new {
            // Acknowledgement is queued ahead of any completion we might
            // send; now the consumers may see the item.
            if let Err(e) = self.in_queue.add_to_queued_list(&item_id).await {
                warn!(item_id = %item_id, error = %e, "Failed to queue admitted item");
                return;
            }
            metrics::counter!("rq_items_received").increment(1);
            self.controller.new_in_item(item).await;
        }
    }

    /// Transfer acknowledged: DISPATCHING becomes DISPATCHED.
    async fn queue_item_transferred(&self, item_id: &str) {
        let _guard = self.queue_items_lock.lock().await;
        match self.out_queue.get(item_id).await {
            Some(item) if item.status == QueueItemStatus::Dispatching => {
                if let Err(e) = self
                    .out_queue
                    .force_status(item_id, QueueItemStatus::Dispatched)
                    .await
                {
                    warn!(item_id = %item_id, error = %e, "Failed to mark item dispatched");
                }
            }
            Some(item) => {
                debug!(item_id = %item_id, status = %item.status, "Transfer acknowledgement for item not dispatching");
            }
            None => {
                debug!(item_id = %item_id, "Transfer acknowledgement for unknown item");
            }
        }
    }

    async fn queue_item_transfer_failure(self: &Arc<Self>, item_id: &str) {
        self.fail_out_item_transfer(item_id, QueueItemStatus::DispatchFailed)
            .await;
    }

    async fn queue_item_transfer_failure_queue_full(self: &Arc<Self>, item_id: &str) {
        self.fail_out_item_transfer(item_id, QueueItemStatus::DispatchFailedQueueFull)
            .await;
    }

    /// Every transfer failure funnels into the controller's requeue
    /// contract; nothing is silently dropped.
    async fn fail_out_item_transfer(self: &Arc<Self>, item_id: &str, status: QueueItemStatus) {
        let item = {
            let _guard = self.queue_items_lock.lock().await;
            match self.out_queue.get(item_id).await {
                Some(item) if !item.is_completed() => {
                    match self.out_queue.force_status(item_id, status).await {
                        Ok(updated) => Some(updated),
                        Err(e) => {
                            warn!(item_id = %item_id, error = %e, "Failed to record transfer failure");
                            None
                        }
                    }
                }
                _ => None,
            }
        };

        if let Some(item) = item {
            metrics::counter!("rq_transfer_failures").increment(1);
            if status == QueueItemStatus::DispatchFailedQueueFull {
                self.controller
                    .unable_to_dispatch_out_item_queue_full(item)
                    .await;
            } else {
                self.controller.unable_to_dispatch_out_item(item).await;
            }
        }
    }

    /// Apply a completion response to the out-queue.
    async fn apply_completion_response(&self, response: QueueItemCompletionResponse) {
        let item = {
            let _guard = self.queue_items_lock.lock().await;
            let Some(item) = self.out_queue.get(&response.item_id).await else {
                debug!(item_id = %response.item_id, "Completion for unknown out-item ignored");
                return;
            };

            let result = if self.config.queue.retain_completed_out_items {
                match response.response_type.completion_status() {
                    Some(status) => self
                        .out_queue
                        .force_status(&response.item_id, status)
                        .await
                        .map(|_| ()),
                    None => Ok(()),
                }
            } else {
                self.out_queue.remove(&response.item_id).await.map(|_| ())
            };
            if let Err(e) = result {
                warn!(item_id = %response.item_id, error = %e, "Failed to finalize completed out-item");
            }
            item
        };

        metrics::counter!("rq_completions_received").increment(1);

        match response.response_type {
            ResponseType::DoneSuccess => {
                self.controller
                    .out_item_done_success(item, response.response_data)
                    .await;
            }
            ResponseType::DoneFailure => {
                self.controller
                    .out_item_done_failure(item, response.response_data)
                    .await;
            }
            ResponseType::DoneCancelled => {
                self.controller.out_item_done_cancelled(item).await;
            }
            ResponseType::RelocationRequired => {
                self.controller.out_item_relocation_required(item).await;
            }
            other => {
                warn!(response_type = ?other, "Unexpected completion response type");
            }
        }
    }

    /// Remote cancellation of an item in our in-queue. A no-op if the item
    /// already completed (last-write-wins against completion).
    async fn queue_item_cancellation_request_received(
        self: &Arc<Self>,
        request: QueueItemCancellationRequest,
    ) {
        match self.cancel_in_item(&request.item_id).await {
            Ok(true) => {
                debug!(item_id = %request.item_id, peer = %request.address, "In-item cancelled on request");
            }
            Ok(false) => {
                debug!(item_id = %request.item_id, "Cancellation request for unknown or completed item");
            }
            Err(e) => {
                warn!(item_id = %request.item_id, error = %e, "Cancellation request failed");
            }
        }
    }

    /// The originator wants a pending in-item back for relocation.
    async fn queue_item_relocation_request_received(
        self: &Arc<Self>,
        request: QueueItemRelocationRequest,
    ) {
        let item = {
            let _guard = self.queue_items_lock.lock().await;
            match self.in_queue.get(&request.item_id).await {
                Some(item) if !item.is_completed() => item,
                _ => {
                    debug!(item_id = %request.item_id, "Relocation request for unknown or completed item");
                    return;
                }
            }
        };

        if item.status == QueueItemStatus::CheckedOut {
            // Cooperative: the consumer has it; the controller decides.
            self.controller.cancel_in_item(item).await;
            return;
        }

        if let Err(e) = self.in_item_relocation_required(&item).await {
            warn!(item_id = %request.item_id, error = %e, "Relocation handover failed");
        }
    }

    // ------------------------------------------------------------------
    // Completion response delivery and caches
    // ------------------------------------------------------------------

    fn cache_unsent_response(&self, response: QueueItemCompletionResponse) {
        self.unsent_completion_responses.insert(
            response.item_id.clone(),
            CachedResponse {
                response,
                cached_at: Utc::now(),
            },
        );
        metrics::gauge!("rq_unsent_completion_responses")
            .set(self.unsent_completion_responses.len() as f64);
    }

    fn cache_recent_response(&self, response: QueueItemCompletionResponse) {
        self.recent_completion_responses.insert(
            response.item_id.clone(),
            CachedResponse {
                response,
                cached_at: Utc::now(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Delivery reports (called from per-peer sequential dispatchers)
    // ------------------------------------------------------------------

    pub async fn command_delivery_report(
        self: &Arc<Self>,
        command: QueueSystemCommand,
        success: bool,
    ) {
        match command {
            QueueSystemCommand::Transfer(request) => {
                if !success {
                    self.queue_item_transfer_request_aborted(request.item).await;
                }
            }
            QueueSystemCommand::MultiTransfer(request) => {
                if !success {
                    for item in request.items {
                        self.queue_item_transfer_request_aborted(item).await;
                    }
                }
            }
            QueueSystemCommand::TransferResponse(response) => {
                if !success {
                    self.queue_item_transfer_response_aborted(response).await;
                }
            }
            QueueSystemCommand::Completion(response) => {
                if success {
                    self.cache_recent_response(response);
                } else {
                    debug!(item_id = %response.item_id, peer = %response.address, "Completion response undeliverable, caching as unsent");
                    self.cache_unsent_response(response);
                }
            }
            QueueSystemCommand::Cancellation(request) => {
                if !success {
                    warn!(item_id = %request.item_id, peer = %request.address, "Unable to send cancellation request");
                }
            }
            QueueSystemCommand::Relocation(request) => {
                if !success {
                    warn!(item_id = %request.item_id, peer = %request.address, "Unable to send relocation request");
                }
            }
            QueueSystemCommand::SyncRequest(request) => {
                if !success {
                    // The maintenance pass re-initiates the handshake.
                    warn!(peer = %request.address, "Unable to send synchronization request");
                }
            }
            QueueSystemCommand::SyncResponse(response) => {
                if !success {
                    warn!(peer = %response.address, "Unable to send synchronization response; peer will re-request");
                }
            }
        }
    }

    /// A transfer never left this system; treat as transfer failure.
    async fn queue_item_transfer_request_aborted(self: &Arc<Self>, item: QueueItem) {
        self.fail_out_item_transfer(&item.id, QueueItemStatus::DispatchFailed)
            .await;
    }

    /// A transfer acknowledgement never reached the sender. The sender
    /// will consider the transfer failed and redispatch, so drop our copy
    /// to avoid processing the item twice.
    async fn queue_item_transfer_response_aborted(&self, response: QueueItemTransferResponse) {
        if response.response_type != ResponseType::TransferSuccess {
            return;
        }
        let _guard = self.queue_items_lock.lock().await;
        match self.in_queue.get(&response.item_id).await {
            Some(item) if item.status == QueueItemStatus::Queued => {
                warn!(item_id = %response.item_id, "Dropping unacknowledged in-item; sender will redispatch");
                if let Err(e) = self.in_queue.remove(&response.item_id).await {
                    warn!(item_id = %response.item_id, error = %e, "Failed to drop unacknowledged in-item");
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------

    pub(crate) async fn destination_link_connected(self: &Arc<Self>, peer: &EndpointAddress) {
        let destination = self.collaboration.get_or_create_destination(peer, self);
        destination.link_connected();
        self.initiate_queue_system_synchronization(&destination)
            .await;
    }

    pub(crate) async fn destination_link_down(self: &Arc<Self>, peer: &EndpointAddress) {
        if let Some(destination) = self.collaboration.destination(peer) {
            destination.destination_link_lost().await;
        }
        self.controller.link_lost(peer).await;
    }

    // ------------------------------------------------------------------
    // Synchronization handshake
    // ------------------------------------------------------------------

    /// Open the handshake: list every out-item we believe is pending at
    /// the peer, so both sides can reconcile persisted state before
    /// normal traffic resumes.
    pub async fn initiate_queue_system_synchronization(
        self: &Arc<Self>,
        destination: &Arc<RemoteQueueSystemDestination>,
    ) {
        let peer = destination.address().clone();
        let out_items: Vec<SyncItemStatus> = self
            .out_queue
            .all_items()
            .await
            .into_iter()
            .filter(|item| {
                item.sender_receiver_address.as_ref() == Some(&peer)
                    && matches!(
                        item.status,
                        QueueItemStatus::Dispatching | QueueItemStatus::Dispatched
                    )
            })
            .map(|item| SyncItemStatus {
                item_id: item.id,
                status: item.status,
            })
            .collect();

        info!(peer = %peer, pending = out_items.len(), "Initiating queue system synchronization");

        let request = QueueSystemCommand::SyncRequest(QueueSystemSynchronizationRequest {
            address: peer,
            out_items,
            meta_data: self.local_meta_data().await,
        });
        destination
            .dispatch_command(request, self, self.collaboration.transport())
            .await;
    }

    /// Server side of the handshake: reconcile our in-queue against the
    /// sender's pending list and answer with what we still hold plus any
    /// completion responses it missed.
    async fn queue_system_synchronization_request_received(
        self: &Arc<Self>,
        request: QueueSystemSynchronizationRequest,
    ) {
        let peer = request.address.clone();
        let destination = self.collaboration.get_or_create_destination(&peer, self);
        destination.link_connected();
        destination.remote_meta_data_updated(request.meta_data);

        let requested: HashMap<String, QueueItemStatus> = request
            .out_items
            .into_iter()
            .map(|entry| (entry.item_id, entry.status))
            .collect();

        let mut queued_item_ids = Vec::new();
        {
            let mut index = self.in_queue.lock().await;
            for item in index.all_items() {
                let from_peer = item.sender_receiver_address.as_ref() == Some(&peer);
                let unknown_sender = item.sender_receiver_address.is_none();

                if unknown_sender && requested.contains_key(&item.id) {
                    // Recovered before the sender address was resolvable;
                    // the peer claims it now.
                    let mut claimed = item.clone();
                    claimed.sender_receiver_address = Some(peer.clone());
                    if let Err(e) = self
                        .in_queue
                        .update_persistent_storage_locked(&mut index, &claimed)
                        .await
                    {
                        warn!(item_id = %claimed.id, error = %e, "Failed to claim recovered item");
                    }
                    if !claimed.is_completed() {
                        queued_item_ids.push(claimed.id);
                    }
                    continue;
                }

                if !from_peer {
                    continue;
                }

                match requested.get(&item.id) {
                    None => {
                        warn!(item_id = %item.id, peer = %peer, "Removing in-item the sender no longer tracks");
                        if let Err(e) = self.in_queue.remove_locked(&mut index, &item.id).await {
                            warn!(item_id = %item.id, error = %e, "Failed to remove stale in-item");
                        }
                    }
                    Some(status)
                        if !matches!(
                            status,
                            QueueItemStatus::Queued
                                | QueueItemStatus::Dispatching
                                | QueueItemStatus::Dispatched
                        ) =>
                    {
                        warn!(item_id = %item.id, sender_status = %status, "Removing in-item the sender considers settled");
                        if let Err(e) = self.in_queue.remove_locked(&mut index, &item.id).await {
                            warn!(item_id = %item.id, error = %e, "Failed to remove settled in-item");
                        }
                    }
                    Some(_) => {
                        if !item.is_completed() {
                            queued_item_ids.push(item.id.clone());
                        }
                    }
                }
            }
        }

        // Completion responses the sender missed, limited to the items it
        // asked about.
        let mut completion_responses = Vec::new();
        let unsent_ids: Vec<String> = self
            .unsent_completion_responses
            .iter()
            .filter(|entry| {
                entry.value().response.address == peer && requested.contains_key(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in unsent_ids {
            if let Some((_, cached)) = self.unsent_completion_responses.remove(&id) {
                completion_responses.push(cached.response);
            }
        }
        for entry in self.recent_completion_responses.iter() {
            if entry.value().response.address == peer
                && requested.contains_key(entry.key())
                && !completion_responses
                    .iter()
                    .any(|r| r.item_id == *entry.key())
            {
                completion_responses.push(entry.value().response.clone());
            }
        }

        info!(
            peer = %peer,
            still_queued = queued_item_ids.len(),
            replayed_completions = completion_responses.len(),
            "Answering queue system synchronization request"
        );

        let response = QueueSystemCommand::SyncResponse(QueueSystemSynchronizationResponse {
            address: peer.clone(),
            queued_item_ids,
            completion_responses,
            meta_data: self.local_meta_data().await,
        });
        destination
            .dispatch_command(response, self, self.collaboration.transport())
            .await;

        destination.synchronization_completed();
        self.controller.link_established(&peer).await;
    }

    /// Client side of the handshake: items the peer still holds become
    /// DISPATCHED; pending items it does not know become transfer
    /// failures; replayed completion responses are applied.
    async fn queue_system_synchronization_response_received(
        self: &Arc<Self>,
        response: QueueSystemSynchronizationResponse,
    ) {
        let peer = response.address.clone();
        let destination = self.collaboration.get_or_create_destination(&peer, self);
        destination.remote_meta_data_updated(response.meta_data.clone());

        let matched: HashSet<&String> = response.queued_item_ids.iter().collect();
        let replayed: HashSet<&String> = response
            .completion_responses
            .iter()
            .map(|r| &r.item_id)
            .collect();

        let mut failures = Vec::new();
        {
            let _guard = self.queue_items_lock.lock().await;
            for item in self.out_queue.all_items().await {
                if item.sender_receiver_address.as_ref() != Some(&peer) {
                    continue;
                }
                if !matches!(
                    item.status,
                    QueueItemStatus::Dispatching | QueueItemStatus::Dispatched
                ) {
                    continue;
                }

                if matched.contains(&item.id) {
                    if item.status != QueueItemStatus::Dispatched {
                        if let Err(e) = self
                            .out_queue
                            .force_status(&item.id, QueueItemStatus::Dispatched)
                            .await
                        {
                            warn!(item_id = %item.id, error = %e, "Failed to mark reconciled item dispatched");
                        }
                    }
                } else if replayed.contains(&item.id) {
                    // Its completion is about to be applied below.
                } else {
                    match self
                        .out_queue
                        .force_status(&item.id, QueueItemStatus::DispatchFailed)
                        .await
                    {
                        Ok(updated) => failures.push(updated),
                        Err(e) => {
                            warn!(item_id = %item.id, error = %e, "Failed to fail unreconciled item");
                        }
                    }
                }
            }
        }

        destination.synchronization_completed();
        self.controller.link_established(&peer).await;

        for item in failures {
            self.controller.unable_to_dispatch_out_item(item).await;
        }
        for completion in response.completion_responses {
            self.apply_completion_response(completion).await;
        }
    }

    /// Wait for the synchronization handshake with every relevant peer
    /// (pending out-queue destinations plus currently connected peers),
    /// up to `timeout`. Returns whether all are established.
    pub async fn wait_for_startup_synchronization(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut targets: HashSet<EndpointAddress> = self
                .out_queue
                .all_items()
                .await
                .into_iter()
                .filter(|item| !item.is_completed())
                .filter_map(|item| item.sender_receiver_address)
                .collect();
            for destination in self.collaboration.destinations() {
                targets.insert(destination.address().clone());
            }

            let all_established = targets
                .iter()
                .all(|address| self.collaboration.is_link_established(address));
            if all_established {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(node = %self.local_address, "Startup synchronization timed out");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // ------------------------------------------------------------------
    // Recovery and periodic checks
    // ------------------------------------------------------------------

    /// Startup scan of the in-queue: checked-out items revert to QUEUED
    /// (their consumer is gone), retained completed items re-announce
    /// their completion responses.
    pub async fn perform_in_queue_check(self: &Arc<Self>) -> Result<()> {
        let items = self.in_queue.all_items().await;
        if items.is_empty() {
            return Ok(());
        }

        for item in &items {
            match item.status {
                QueueItemStatus::CheckedOut => {
                    self.in_queue
                        .force_status(&item.id, QueueItemStatus::Queued)
                        .await?;
                }
                status if status.is_completed() => {
                    if let Some(address) = item.sender_receiver_address.clone() {
                        let response_type = match status {
                            QueueItemStatus::DoneSuccess => ResponseType::DoneSuccess,
                            QueueItemStatus::DoneFailure => ResponseType::DoneFailure,
                            _ => ResponseType::DoneCancelled,
                        };
                        self.cache_unsent_response(QueueItemCompletionResponse {
                            address,
                            item_id: item.id.clone(),
                            response_type,
                            response_data: None,
                            meta_data: None,
                        });
                    }
                }
                _ => {}
            }
        }

        info!(node = %self.local_address, count = items.len(), "In-queue recovery check complete");
        self.controller.recovered_items_in_in_queue(items).await;
        Ok(())
    }

    /// Startup scan of the out-queue: earlier dispatch failures go back
    /// through the requeue contract; DISPATCHING/DISPATCHED items are left
    /// for the synchronization handshake to settle.
    pub async fn perform_out_queue_check(self: &Arc<Self>) -> Result<()> {
        let items = self.out_queue.all_items().await;
        if items.is_empty() {
            return Ok(());
        }

        for item in &items {
            match item.status {
                QueueItemStatus::DispatchFailed | QueueItemStatus::RelocationRequired => {
                    self.controller.unable_to_dispatch_out_item(item.clone()).await;
                }
                QueueItemStatus::DispatchFailedQueueFull => {
                    self.controller
                        .unable_to_dispatch_out_item_queue_full(item.clone())
                        .await;
                }
                _ => {}
            }
        }

        info!(node = %self.local_address, count = items.len(), "Out-queue recovery check complete");
        self.controller.recovered_items_in_out_queue(items).await;
        Ok(())
    }

    /// Ensure every connected destination eventually completes the
    /// handshake; re-initiates synchronization when a request was lost.
    pub async fn perform_queue_system_check(self: &Arc<Self>) {
        for destination in self.collaboration.destinations() {
            let connected = self
                .collaboration
                .transport()
                .is_connected(destination.address());
            if connected
                && destination.link_state() == crate::destination::LinkState::ConnectedUnsynchronized
            {
                debug!(peer = %destination.address(), "Re-initiating stalled synchronization");
                self.initiate_queue_system_synchronization(&destination)
                    .await;
            }
        }
    }

    /// Age scan over the out-queue: DISPATCHING items whose peer is gone
    /// or that are stuck too long become transfer failures; long-lived
    /// DISPATCHED items get escalating warnings.
    pub async fn perform_out_item_check(self: &Arc<Self>) {
        let now = Utc::now();
        let dead_peer_grace =
            chrono::Duration::seconds(self.config.engine.dead_peer_grace_secs as i64);
        let stuck_timeout =
            chrono::Duration::seconds(self.config.engine.dispatch_stuck_timeout_secs as i64);
        let warning_base = self.config.engine.dispatched_age_warning_secs as i64;

        for item in self.out_queue.all_with_status(QueueItemStatus::Dispatching).await {
            let age = now - item.send_receive_time;
            let peer_connected = item
                .sender_receiver_address
                .as_ref()
                .map(|address| self.collaboration.transport().is_connected(address))
                .unwrap_or(false);

            if (!peer_connected && age > dead_peer_grace) || age > stuck_timeout {
                warn!(
                    item_id = %item.id,
                    age_secs = age.num_seconds(),
                    peer_connected,
                    "Dispatching item timed out, treating as transfer failure"
                );
                self.queue_item_transfer_failure(&item.id).await;
            }
        }

        for mut item in self.out_queue.all_with_status(QueueItemStatus::Dispatched).await {
            let age = now - item.send_receive_time;
            let threshold =
                chrono::Duration::seconds(warning_base * (item.age_warning_count as i64 + 1));
            if age > threshold {
                item.age_warning_count += 1;
                warn!(
                    item_id = %item.id,
                    age_secs = age.num_seconds(),
                    warning = item.age_warning_count,
                    "Dispatched item has been pending unusually long"
                );
                if let Err(e) = self.out_queue.update_persistent_storage(&item).await {
                    warn!(item_id = %item.id, error = %e, "Failed to record age warning");
                }
            }
        }
    }

    /// Prune aged unsent completion responses and redispatch the ones
    /// whose destination link came back.
    pub async fn check_unsent_completion_responses(self: &Arc<Self>) {
        let max_age =
            chrono::Duration::hours(self.config.engine.unsent_response_max_age_hours as i64);
        let now = Utc::now();

        let ids: Vec<String> = self
            .unsent_completion_responses
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for id in ids {
            let Some(entry) = self
                .unsent_completion_responses
                .get(&id)
                .map(|e| e.value().clone())
            else {
                continue;
            };

            if now - entry.cached_at > max_age {
                info!(item_id = %id, "Discarding unsent completion response due to old age");
                self.unsent_completion_responses.remove(&id);
                continue;
            }

            if self
                .collaboration
                .is_link_established(&entry.response.address)
            {
                info!(item_id = %id, peer = %entry.response.address, "Redispatching unsent completion response");
                self.unsent_completion_responses.remove(&id);
                self.collaboration
                    .dispatch_command(QueueSystemCommand::Completion(entry.response), self)
                    .await;
            }
        }
    }

    fn prune_recent_completion_responses(&self) {
        let retention =
            chrono::Duration::seconds(self.config.engine.recent_response_retention_secs as i64);
        let now = Utc::now();
        self.recent_completion_responses
            .retain(|_, cached| now - cached.cached_at <= retention);
    }
}

/// Periodic maintenance: response-cache upkeep, handshake supervision, and
/// the out-item age scan.
async fn run_maintenance(manager: Arc<QueueManager>, mut shutdown_rx: broadcast::Receiver<()>) {
    let interval = Duration::from_millis(manager.config.engine.check_interval_ms);
    debug!(node = %manager.local_address, interval_ms = interval.as_millis() as u64, "Maintenance loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.recv() => break,
        }
        if !manager.is_running() {
            break;
        }

        manager.check_unsent_completion_responses().await;
        manager.prune_recent_completion_responses();
        manager.perform_queue_system_check().await;
        manager.perform_out_item_check().await;

        metrics::gauge!("rq_in_queue_length").set(manager.in_queue.len().await as f64);
        metrics::gauge!("rq_out_queue_length").set(manager.out_queue.len().await as f64);
    }

    debug!(node = %manager.local_address, "Maintenance loop stopped");
}
