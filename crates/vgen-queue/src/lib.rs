//! Durable queue of generation requests.
//!
//! Stores hand out short-lived [`QueueSession`]s. A session is the unit of
//! exclusive access to the backing store (a connection, or the lock of the
//! in-memory store) and is dropped as soon as the entry update is done.

pub mod entry;
pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use entry::{EntryStatus, QueueEntry};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueueStore;
pub use redis_store::{QueueConfig, RedisQueueStore};
pub use store::{QueueSession, QueueStore};
