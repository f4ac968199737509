//! Queue state tracking for display.
//!
//! The store holds actions still owed to the server and the recent drops.
//! What this process saw of its own passes lives here.

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use outbox_common::{DropReason, DroppedAction};
use outbox_common::PendingAction;

use crate::coordinator::PassReport;

/// In-memory history of this process's passes.
#[derive(Debug, Clone, Default)]
pub struct QueueState {
    /// Report of the last completed pass.
    pub last_pass: Option<PassReport>,
    /// When the last pass completed.
    pub last_pass_at: Option<DateTime<Utc>>,
    /// Actions delivered since startup.
    pub total_delivered: u64,
    /// Actions dropped since startup.
    pub total_dropped: u64,
}

impl QueueState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a drop.
    pub fn record_drop(&mut self) {
        self.total_dropped += 1;
    }

    /// Remember a completed pass.
    pub fn record_pass(&mut self, report: &PassReport) {
        self.total_delivered += report.delivered as u64;
        self.last_pass = Some(report.clone());
        self.last_pass_at = Some(Utc::now());
    }
}

/// Snapshot of the queue for display.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Actions still owed to the server, in dispatch order.
    pub pending: Vec<PendingAction>,
    /// Recent drops, oldest first.
    pub recently_dropped: Vec<DroppedAction>,
    /// Report of the last completed pass.
    pub last_pass: Option<PassReport>,
    /// When the last pass completed.
    pub last_pass_at: Option<DateTime<Utc>>,
    /// Whether a pass is running right now.
    pub sync_in_progress: bool,
    /// Current connectivity.
    pub online: bool,
}

impl QueueStatus {
    /// Number of pending actions with at least one failed attempt.
    pub fn retrying(&self) -> usize {
        self.pending.iter().filter(|a| a.retry_count > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_common::{ActionType, Priority};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_record_pass() {
        let mut state = QueueState::new();
        let report = PassReport {
            attempted: 3,
            delivered: 2,
            retried: 1,
            dropped: 0,
            duration: Duration::from_millis(5),
        };
        state.record_pass(&report);
        state.record_pass(&report);
        state.record_drop();
        assert_eq!(state.total_delivered, 4);
        assert_eq!(state.total_dropped, 1);
        assert_eq!(state.last_pass.as_ref().map(|r| r.retried), Some(1));
        assert!(state.last_pass_at.is_some());
    }

    #[test]
    fn test_status_counts_retrying() {
        let mut retrying = PendingAction::new(ActionType::LikePost, json!({}), Priority::Low);
        retrying.retry_count = 2;
        let fresh = PendingAction::new(ActionType::LikePost, json!({}), Priority::Low);
        let status = QueueStatus {
            pending: vec![retrying, fresh],
            recently_dropped: Vec::new(),
            last_pass: None,
            last_pass_at: None,
            sync_in_progress: false,
            online: true,
        };
        assert_eq!(status.retrying(), 1);
    }
}
