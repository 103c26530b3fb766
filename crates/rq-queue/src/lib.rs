//! Thread-safe, status-indexed queue item store with blocking checkout and
//! persistence pass-through.

pub mod error;
pub mod queue;
pub mod storage;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::QueueError;
pub use queue::{Queue, QueueIndex};
pub use storage::{NullQueueStorage, QueueStorage};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQueueStorage;

pub type Result<T> = std::result::Result<T, QueueError>;
