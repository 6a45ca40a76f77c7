//! Durable local storage for Outbox.
//!
//! This module provides a trait-based interface for persistent key-value
//! backends (in-memory, plain files, SQLite) and the durable queue of
//! pending actions built on top of it.
//!
//! # Design Principles
//! - Backend isolation: the queue never knows which backend it runs on
//! - Async operations: all I/O operations are async
//! - Whole-collection writes: the queue is always persisted as one unit

pub mod store;
pub mod memory;
pub mod local;
pub mod sqlite;
pub mod queue;

pub use store::KeyValueStore;
pub use memory::MemoryStore;
pub use local::FileStore;
pub use sqlite::SqliteStore;
pub use queue::{LenObserver, QueueStore, LAST_SYNC_KEY, PENDING_ACTIONS_KEY};
