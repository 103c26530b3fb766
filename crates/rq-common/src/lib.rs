use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub mod logging;

// ============================================================================
// Addresses
// ============================================================================

/// Opaque handle identifying a peer queue system.
///
/// Backed by a name that the transport layer resolves to an actual endpoint
/// (a mailbox name for the in-process transport, host:port for a socket
/// transport).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(String);

impl EndpointAddress {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Queue Items
// ============================================================================

/// Status of a queue item. The discriminant values are the wire codes used
/// in synchronization requests and persisted storage rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueItemStatus {
    /// Admitted to a queue, waiting to be checked out by a consumer.
    Queued,
    /// Checked out by a local consumer for processing.
    CheckedOut,
    /// Handed to the collaboration layer, transfer acknowledgement pending.
    Dispatching,
    /// Transfer acknowledged by the remote in-queue.
    Dispatched,
    /// Transfer failed (no link, send error, peer rejected).
    DispatchFailed,
    /// Transfer rejected because the remote in-queue was full.
    DispatchFailedQueueFull,
    DoneSuccess,
    DoneFailure,
    DoneCancelled,
    /// The remote peer could not complete the item; it must be re-dispatched
    /// to an alternate destination.
    RelocationRequired,
}

impl QueueItemStatus {
    pub fn code(&self) -> u8 {
        match self {
            QueueItemStatus::Queued => 0,
            QueueItemStatus::CheckedOut => 1,
            QueueItemStatus::Dispatching => 2,
            QueueItemStatus::Dispatched => 3,
            QueueItemStatus::DispatchFailed => 4,
            QueueItemStatus::DispatchFailedQueueFull => 5,
            QueueItemStatus::DoneSuccess => 6,
            QueueItemStatus::DoneFailure => 7,
            QueueItemStatus::DoneCancelled => 8,
            QueueItemStatus::RelocationRequired => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(QueueItemStatus::Queued),
            1 => Some(QueueItemStatus::CheckedOut),
            2 => Some(QueueItemStatus::Dispatching),
            3 => Some(QueueItemStatus::Dispatched),
            4 => Some(QueueItemStatus::DispatchFailed),
            5 => Some(QueueItemStatus::DispatchFailedQueueFull),
            6 => Some(QueueItemStatus::DoneSuccess),
            7 => Some(QueueItemStatus::DoneFailure),
            8 => Some(QueueItemStatus::DoneCancelled),
            9 => Some(QueueItemStatus::RelocationRequired),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::DoneSuccess
                | QueueItemStatus::DoneFailure
                | QueueItemStatus::DoneCancelled
        )
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueItemStatus::Queued => "QUEUED",
            QueueItemStatus::CheckedOut => "CHECKED_OUT",
            QueueItemStatus::Dispatching => "DISPATCHING",
            QueueItemStatus::Dispatched => "DISPATCHED",
            QueueItemStatus::DispatchFailed => "DISPATCH_FAILED",
            QueueItemStatus::DispatchFailedQueueFull => "DISPATCH_FAILED_QUEUE_FULL",
            QueueItemStatus::DoneSuccess => "DONE_SUCCESS",
            QueueItemStatus::DoneFailure => "DONE_FAILURE",
            QueueItemStatus::DoneCancelled => "DONE_CANCELLED",
            QueueItemStatus::RelocationRequired => "RELOCATION_REQUIRED",
        };
        f.write_str(name)
    }
}

/// The opaque unit-of-work payload carried by a queue item. The core never
/// interprets the payload; the description is for logs and admin surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemData {
    pub description: String,
    pub payload: serde_json::Value,
}

impl ItemData {
    pub fn new(description: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            description: description.into(),
            payload,
        }
    }
}

/// One unit of work, either created locally (out-queue) or received from a
/// peer (in-queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique within the originating queue system.
    pub id: String,
    /// Set when this item was created by relaying a received item.
    pub parent_id: Option<String>,
    /// The peer this item was dispatched to (out-queue) or received from
    /// (in-queue).
    pub sender_receiver_address: Option<EndpointAddress>,
    pub item_data: ItemData,
    pub status: QueueItemStatus,
    /// Incremented on every (re)dispatch.
    pub dispatch_count: u32,
    /// Last dispatch/receipt instant, used for age-based checks.
    pub send_receive_time: DateTime<Utc>,
    /// Number of age-limit warnings issued while DISPATCHED; each warning
    /// raises the next threshold.
    pub age_warning_count: u16,
}

impl QueueItem {
    pub fn new(item_data: ItemData) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), item_data)
    }

    pub fn with_id(id: String, item_data: ItemData) -> Self {
        Self {
            id,
            parent_id: None,
            sender_receiver_address: None,
            item_data,
            status: QueueItemStatus::Queued,
            dispatch_count: 0,
            send_receive_time: Utc::now(),
            age_warning_count: 0,
        }
    }

    /// Creates a child item for relaying a received parent downstream.
    pub fn child_of(parent: &QueueItem) -> Self {
        let mut child = Self::new(parent.item_data.clone());
        child.parent_id = Some(parent.id.clone());
        child
    }

    pub fn increment_dispatch_count(&mut self) {
        self.dispatch_count += 1;
    }

    pub fn touch_send_receive_time(&mut self) {
        self.send_receive_time = Utc::now();
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}

impl fmt::Display for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueItem({}, {}, {})",
            self.id, self.item_data.description, self.status
        )
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Tag carried by transfer and completion responses. Discriminant values
/// are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    TransferSuccess,
    TransferFailure,
    TransferQueueFull,
    DoneSuccess,
    DoneFailure,
    DoneCancelled,
    RelocationRequired,
}

impl ResponseType {
    pub fn code(&self) -> u8 {
        match self {
            ResponseType::TransferSuccess => 0,
            ResponseType::TransferFailure => 1,
            ResponseType::TransferQueueFull => 2,
            ResponseType::DoneSuccess => 3,
            ResponseType::DoneFailure => 4,
            ResponseType::DoneCancelled => 5,
            ResponseType::RelocationRequired => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ResponseType::TransferSuccess),
            1 => Some(ResponseType::TransferFailure),
            2 => Some(ResponseType::TransferQueueFull),
            3 => Some(ResponseType::DoneSuccess),
            4 => Some(ResponseType::DoneFailure),
            5 => Some(ResponseType::DoneCancelled),
            6 => Some(ResponseType::RelocationRequired),
            _ => None,
        }
    }

    /// The item status a completed in-item takes for this response type.
    pub fn completion_status(&self) -> Option<QueueItemStatus> {
        match self {
            ResponseType::DoneSuccess => Some(QueueItemStatus::DoneSuccess),
            ResponseType::DoneFailure => Some(QueueItemStatus::DoneFailure),
            ResponseType::DoneCancelled => Some(QueueItemStatus::DoneCancelled),
            ResponseType::RelocationRequired => Some(QueueItemStatus::RelocationRequired),
            _ => None,
        }
    }
}

// ============================================================================
// Queue System Metadata
// ============================================================================

/// Snapshot of a queue system's in-queue state, exchanged during
/// synchronization and piggybacked on responses for flow control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSystemMetaData {
    pub in_queue_length: u64,
    /// None means unbounded.
    pub in_queue_max_length: Option<u64>,
    pub in_queue_blocked: bool,
    /// Free-form properties. Presence of extras changes how an update is
    /// merged into the previous record (see the destination merge rule).
    pub extra: HashMap<String, serde_json::Value>,
}

impl QueueSystemMetaData {
    pub fn new(in_queue_length: u64, in_queue_max_length: Option<u64>, in_queue_blocked: bool) -> Self {
        Self {
            in_queue_length,
            in_queue_max_length,
            in_queue_blocked,
            extra: HashMap::new(),
        }
    }

    pub fn has_extra_data(&self) -> bool {
        !self.extra.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=9u8 {
            let status = QueueItemStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(QueueItemStatus::from_code(10).is_none());
    }

    #[test]
    fn response_type_codes_round_trip() {
        for code in 0..=6u8 {
            let rt = ResponseType::from_code(code).unwrap();
            assert_eq!(rt.code(), code);
        }
        assert!(ResponseType::from_code(7).is_none());
    }

    #[test]
    fn completion_status_mapping() {
        assert_eq!(
            ResponseType::DoneSuccess.completion_status(),
            Some(QueueItemStatus::DoneSuccess)
        );
        assert_eq!(ResponseType::TransferSuccess.completion_status(), None);
    }

    #[test]
    fn child_item_links_to_parent() {
        let parent = QueueItem::new(ItemData::new("job", serde_json::json!({"n": 1})));
        let child = QueueItem::child_of(&parent);
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_ne!(child.id, parent.id);
        assert_eq!(child.item_data.description, "job");
    }

    #[test]
    fn terminal_statuses() {
        assert!(QueueItemStatus::DoneSuccess.is_completed());
        assert!(QueueItemStatus::DoneCancelled.is_completed());
        assert!(!QueueItemStatus::Dispatched.is_completed());
        assert!(!QueueItemStatus::RelocationRequired.is_completed());
    }
}
