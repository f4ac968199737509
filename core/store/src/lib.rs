//! Durable queue storage for pending actions.
//!
//! This module provides a trait-based interface over the table of pending
//! actions, with a SQLite backend for durable queues and an in-memory
//! backend for tests.
//!
//! # Design Principles
//! - Async operations: every call may suspend
//! - Atomic per-record add/put/delete under interleaved callers
//! - Priority ordering with insertion order as the tie breaker
//! - Dropped actions stay visible through a bounded history

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{QueueStore, DEFAULT_DROP_HISTORY};
