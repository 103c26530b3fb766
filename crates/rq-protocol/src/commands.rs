//! Command types exchanged between queue systems.
//!
//! The `address` on each command is the peer on the other end of the link:
//! the destination when outbound, the sender once decoded. It never travels
//! on the wire; the collaboration layer stamps it from the link a frame
//! arrived on.

use std::fmt;

use rq_common::{EndpointAddress, QueueItem, QueueItemStatus, QueueSystemMetaData, ResponseType};

/// Transfers one queue item to the peer's in-queue.
#[derive(Debug, Clone)]
pub struct QueueItemTransferRequest {
    pub address: EndpointAddress,
    pub item: QueueItem,
}

/// Batched transfer.
#[derive(Debug, Clone)]
pub struct MultiQueueItemTransferRequest {
    pub address: EndpointAddress,
    pub items: Vec<QueueItem>,
}

/// Acknowledges a transfer request: accepted, rejected, or rejected because
/// the in-queue was full. Carries the receiver's queue metadata for flow
/// control.
#[derive(Debug, Clone)]
pub struct QueueItemTransferResponse {
    pub address: EndpointAddress,
    pub item_id: String,
    pub response_type: ResponseType,
    pub meta_data: Option<QueueSystemMetaData>,
}

/// Reports the outcome of processing a transferred item back to its
/// originator.
#[derive(Debug, Clone)]
pub struct QueueItemCompletionResponse {
    pub address: EndpointAddress,
    pub item_id: String,
    pub response_type: ResponseType,
    pub response_data: Option<serde_json::Value>,
    pub meta_data: Option<QueueSystemMetaData>,
}

/// Cooperative cancellation of an in-flight item by id.
#[derive(Debug, Clone)]
pub struct QueueItemCancellationRequest {
    pub address: EndpointAddress,
    pub item_id: String,
}

/// Asks the peer to relocate an item it sent here to an alternate
/// destination.
#[derive(Debug, Clone)]
pub struct QueueItemRelocationRequest {
    pub address: EndpointAddress,
    pub item_id: String,
}

/// Id and status of one out-item, as carried by a synchronization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncItemStatus {
    pub item_id: String,
    pub status: QueueItemStatus,
}

/// Opens the post-(re)connect reconciliation handshake: the sender lists
/// every out-item it believes is pending at the receiver.
#[derive(Debug, Clone)]
pub struct QueueSystemSynchronizationRequest {
    pub address: EndpointAddress,
    pub out_items: Vec<SyncItemStatus>,
    pub meta_data: QueueSystemMetaData,
}

/// Answers a synchronization request: which of the listed items the
/// receiver still holds, plus completion responses the sender missed.
#[derive(Debug, Clone)]
pub struct QueueSystemSynchronizationResponse {
    pub address: EndpointAddress,
    pub queued_item_ids: Vec<String>,
    pub completion_responses: Vec<QueueItemCompletionResponse>,
    pub meta_data: QueueSystemMetaData,
}

/// Every protocol message, as a tagged union dispatched by the receiving
/// queue manager.
#[derive(Debug, Clone)]
pub enum QueueSystemCommand {
    Transfer(QueueItemTransferRequest),
    MultiTransfer(MultiQueueItemTransferRequest),
    TransferResponse(QueueItemTransferResponse),
    Completion(QueueItemCompletionResponse),
    Cancellation(QueueItemCancellationRequest),
    Relocation(QueueItemRelocationRequest),
    SyncRequest(QueueSystemSynchronizationRequest),
    SyncResponse(QueueSystemSynchronizationResponse),
}

impl QueueSystemCommand {
    /// Wire discriminant for this command kind.
    pub fn kind(&self) -> u8 {
        match self {
            QueueSystemCommand::Transfer(_) => 0x01,
            QueueSystemCommand::MultiTransfer(_) => 0x02,
            QueueSystemCommand::TransferResponse(_) => 0x03,
            QueueSystemCommand::Completion(_) => 0x04,
            QueueSystemCommand::Cancellation(_) => 0x05,
            QueueSystemCommand::Relocation(_) => 0x06,
            QueueSystemCommand::SyncRequest(_) => 0x07,
            QueueSystemCommand::SyncResponse(_) => 0x08,
        }
    }

    /// The peer this command is addressed to (outbound) or arrived from
    /// (inbound).
    pub fn address(&self) -> &EndpointAddress {
        match self {
            QueueSystemCommand::Transfer(c) => &c.address,
            QueueSystemCommand::MultiTransfer(c) => &c.address,
            QueueSystemCommand::TransferResponse(c) => &c.address,
            QueueSystemCommand::Completion(c) => &c.address,
            QueueSystemCommand::Cancellation(c) => &c.address,
            QueueSystemCommand::Relocation(c) => &c.address,
            QueueSystemCommand::SyncRequest(c) => &c.address,
            QueueSystemCommand::SyncResponse(c) => &c.address,
        }
    }

    /// Item id this command is about, when it concerns a single item.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            QueueSystemCommand::Transfer(c) => Some(&c.item.id),
            QueueSystemCommand::MultiTransfer(_) => None,
            QueueSystemCommand::TransferResponse(c) => Some(&c.item_id),
            QueueSystemCommand::Completion(c) => Some(&c.item_id),
            QueueSystemCommand::Cancellation(c) => Some(&c.item_id),
            QueueSystemCommand::Relocation(c) => Some(&c.item_id),
            QueueSystemCommand::SyncRequest(_) => None,
            QueueSystemCommand::SyncResponse(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueSystemCommand::Transfer(_) => "QueueItemTransferRequest",
            QueueSystemCommand::MultiTransfer(_) => "MultiQueueItemTransferRequest",
            QueueSystemCommand::TransferResponse(_) => "QueueItemTransferResponse",
            QueueSystemCommand::Completion(_) => "QueueItemCompletionResponse",
            QueueSystemCommand::Cancellation(_) => "QueueItemCancellationRequest",
            QueueSystemCommand::Relocation(_) => "QueueItemRelocationRequest",
            QueueSystemCommand::SyncRequest(_) => "QueueSystemSynchronizationRequest",
            QueueSystemCommand::SyncResponse(_) => "QueueSystemSynchronizationResponse",
        }
    }
}

impl fmt::Display for QueueSystemCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.item_id() {
            Some(id) => write!(f, "{}({}, {})", self.name(), self.address(), id),
            None => write!(f, "{}({})", self.name(), self.address()),
        }
    }
}
