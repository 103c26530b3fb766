//! The queue engine: dispatch and lifecycle orchestration over an in-queue
//! and an out-queue, per-peer sequential command delivery, back-pressure,
//! and the post-reconnect synchronization handshake.

pub mod collaboration;
pub mod controller;
pub mod destination;
pub mod error;
pub mod manager;
pub mod transport;

pub use collaboration::CollaborationManager;
pub use controller::{QueueController, RedispatchQueue};
pub use destination::{LinkState, RemoteQueueSystemDestination};
pub use error::EngineError;
pub use manager::QueueManager;
pub use transport::{InProcessNetwork, InProcessTransport, MessageTransport, TransportEvent};

pub type Result<T> = std::result::Result<T, EngineError>;
