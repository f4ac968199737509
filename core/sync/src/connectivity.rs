//! Network reachability tracking.
//!
//! The monitor does not probe the network itself; whatever owns the
//! platform signal feeds observations into [`ConnectivityMonitor::set_online`].
//! Observations are best-effort: a device that reports online without a
//! route to the server just produces delivery failures later.

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Transitions buffered per subscriber before it starts lagging.
const TRANSITION_BUFFER: usize = 16;

/// Current reachability plus transition notifications.
///
/// Cloning yields another handle onto the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    transitions: broadcast::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Create a monitor with an initial observation.
    pub fn new(initial_online: bool) -> Self {
        let (state, _rx) = watch::channel(initial_online);
        let (transitions, _rx) = broadcast::channel(TRANSITION_BUFFER);
        Self { state, transitions }
    }

    /// Whether the device currently looks online.
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record an observation.
    ///
    /// Returns `true` if this changed the state. Each change is delivered
    /// to every subscriber, in order; repeated reports of the same state
    /// are absorbed here.
    pub fn set_online(&self, online: bool) -> bool {
        // Publishing inside the state lock keeps transitions in state order.
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                let _ = self.transitions.send(online);
                true
            }
        });

        if changed {
            if online {
                info!("Network: online");
            } else {
                warn!("Network: offline");
            }
        }
        changed
    }

    /// Subscribe to state transitions from now on.
    pub fn subscribe(&self) -> ConnectivitySubscription {
        let state = self.state.subscribe();
        let transitions = self.transitions.subscribe();
        let last = *state.borrow();
        ConnectivitySubscription {
            state,
            transitions,
            last,
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Handle on connectivity transitions.
///
/// Dropping the handle or calling [`unsubscribe`](Self::unsubscribe) ends
/// the subscription.
#[derive(Debug)]
pub struct ConnectivitySubscription {
    state: watch::Receiver<bool>,
    transitions: broadcast::Receiver<bool>,
    /// Last state handed to the subscriber.
    last: bool,
}

impl ConnectivitySubscription {
    /// Wait for the next transition and return the new state.
    ///
    /// Every transition is returned once, in order. A subscriber that falls
    /// more than a few transitions behind skips the oldest ones, but never
    /// sees the same state twice in a row.
    ///
    /// Returns `None` once every monitor handle is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        loop {
            match self.transitions.recv().await {
                Ok(online) if online == self.last => continue,
                Ok(online) => {
                    self.last = online;
                    return Some(online);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Connectivity subscriber skipped {} transitions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Current state of the monitor.
    pub fn current(&self) -> bool {
        *self.state.borrow()
    }

    /// End the subscription.
    pub fn unsubscribe(self) {}
}
