//! Queue change notifications.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use outbox_common::{ActionId, ActionType};

use crate::coordinator::PassReport;
use crate::state::DroppedAction;

/// Something observable happened to the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Enqueued {
        id: ActionId,
        action_type: ActionType,
    },
    Delivered {
        id: ActionId,
        action_type: ActionType,
    },
    RetryScheduled {
        id: ActionId,
        action_type: ActionType,
        retry_count: u32,
    },
    Dropped(DroppedAction),
    PassFinished(PassReport),
    Cleared,
}

/// Fan-out of queue events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Handle on queue events.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<QueueEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the engine is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// End the subscription.
    pub fn unsubscribe(self) {}
}
