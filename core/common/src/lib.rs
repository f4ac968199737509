//! Common utilities and types shared across the outbox crates.
//!
//! This module provides the queue's data model and the error type used
//! by the store, the sync engine and the CLI.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ActionId, ActionStatus, ActionType, DropReason, DroppedAction, PendingAction, Priority};
