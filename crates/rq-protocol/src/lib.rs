//! Queue-system-to-queue-system command protocol: the command types and
//! their explicit, version-tagged wire codec.

pub mod codec;
pub mod commands;
pub mod error;

pub use codec::{decode, encode, QUEUE_COMMAND_VERSION};
pub use commands::{
    MultiQueueItemTransferRequest, QueueItemCancellationRequest, QueueItemCompletionResponse,
    QueueItemRelocationRequest, QueueItemTransferRequest, QueueItemTransferResponse,
    QueueSystemCommand, QueueSystemSynchronizationRequest, QueueSystemSynchronizationResponse,
    SyncItemStatus,
};
pub use error::ProtocolError;
