//! Queue store trait definition.

use async_trait::async_trait;

use outbox_common::{ActionId, ActionType, DroppedAction, PendingAction, Result};

/// Default number of drops a store remembers.
pub const DEFAULT_DROP_HISTORY: usize = 50;

/// Persistent, keyed table of pending actions.
///
/// Implementations must keep every single-record operation atomic so that
/// interleaved async callers never observe or produce a torn record.
///
/// Next to the queue, a store keeps a bounded history of actions that left
/// it undelivered, so any process sharing the store can show them.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Get the backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Insert a new action.
    ///
    /// # Postconditions
    /// - The action is recorded after every action added before it
    ///
    /// # Errors
    /// - `AlreadyExists` if an action with the same id is stored
    /// - `Storage` if the backend is unavailable
    async fn add(&self, action: &PendingAction) -> Result<()>;

    /// Every stored action, in no particular order.
    async fn get_all(&self) -> Result<Vec<PendingAction>>;

    /// Every stored action, highest priority first.
    ///
    /// Actions of equal priority come back in insertion order (older
    /// first) so that earlier actions are never starved.
    async fn get_all_by_priority(&self) -> Result<Vec<PendingAction>>;

    /// Stored actions of one type, in insertion order.
    async fn get_by_type(&self, action_type: ActionType) -> Result<Vec<PendingAction>>;

    /// Remove an action. Removing an absent id is a no-op.
    async fn delete(&self, id: &ActionId) -> Result<()>;

    /// Replace an existing action in place.
    ///
    /// The action keeps its insertion position.
    ///
    /// # Errors
    /// - `NotFound` if no action with this id is stored
    async fn put(&self, action: &PendingAction) -> Result<()>;

    /// Number of stored actions.
    async fn count(&self) -> Result<usize>;

    /// Remove every stored action.
    async fn clear(&self) -> Result<()>;

    /// Remove an action from the queue and remember it as dropped.
    ///
    /// Both happen together. The action need not still be queued. Only the
    /// most recent drops are kept, up to the store's drop history limit.
    async fn record_drop(&self, dropped: &DroppedAction) -> Result<()>;

    /// Remembered drops, oldest first.
    async fn recent_drops(&self) -> Result<Vec<DroppedAction>>;

    /// Forget every remembered drop.
    async fn clear_drops(&self) -> Result<()>;
}
