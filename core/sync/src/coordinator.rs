//! Sync pass execution.
//!
//! A pass snapshots the queue in dispatch order and drains it one action at
//! a time. At most one pass runs per coordinator; a pass requested while
//! another is running is skipped rather than queued, since the running pass
//! will pick up whatever is in the snapshot and later passes pick up the rest.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use outbox_common::{Error, PendingAction, Result};
use outbox_store::QueueStore;

use crate::connectivity::ConnectivityMonitor;
use crate::dispatcher::{ActionDispatcher, DispatchOutcome};
use crate::events::{EventBus, QueueEvent};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{DropReason, DroppedAction, QueueState};

/// Summary of one completed pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// Actions taken from the snapshot.
    pub attempted: usize,
    /// Actions the server accepted.
    pub delivered: usize,
    /// Actions kept for a later pass.
    pub retried: usize,
    /// Actions given up on.
    pub dropped: usize,
    /// Wall time of the pass.
    pub duration: Duration,
}

impl PassReport {
    /// True if nothing was left behind for a later pass.
    pub fn is_clean(&self) -> bool {
        self.retried == 0
    }
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

/// Result of asking for a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    Completed(PassReport),
    Skipped(SkipReason),
}

impl PassOutcome {
    /// True if a pass actually ran.
    pub fn is_completed(&self) -> bool {
        matches!(self, PassOutcome::Completed(_))
    }

    /// Report of the pass, if one ran.
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            PassOutcome::Skipped(_) => None,
        }
    }
}

/// Holds the in-progress flag for the lifetime of a pass.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs sync passes against a store.
pub struct SyncCoordinator {
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<ActionDispatcher>,
    connectivity: ConnectivityMonitor,
    retry_policy: RetryPolicy,
    in_progress: AtomicBool,
    state: Arc<RwLock<QueueState>>,
    events: EventBus,
}

impl SyncCoordinator {
    /// Create a coordinator.
    pub fn new(
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<ActionDispatcher>,
        connectivity: ConnectivityMonitor,
        retry_policy: RetryPolicy,
        state: Arc<RwLock<QueueState>>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            dispatcher,
            connectivity,
            retry_policy,
            in_progress: AtomicBool::new(false),
            state,
            events,
        }
    }

    /// Whether a pass is running right now.
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Retry policy applied to failed deliveries.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Run one pass over the queue.
    ///
    /// Failures of individual actions are absorbed into the report.
    ///
    /// # Errors
    /// - Store read or write failures
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            debug!("Sync pass already running, skipping");
            return Ok(PassOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        if !self.connectivity.is_online() {
            debug!("Offline, skipping sync pass");
            return Ok(PassOutcome::Skipped(SkipReason::Offline));
        }

        let start = Instant::now();
        let snapshot = self.store.get_all_by_priority().await?;
        let mut report = PassReport {
            attempted: snapshot.len(),
            ..PassReport::default()
        };

        if !snapshot.is_empty() {
            info!("Sync pass started: {} pending", snapshot.len());
        }

        for action in snapshot {
            self.process(action, &mut report).await?;
        }

        report.duration = start.elapsed();
        if report.attempted > 0 {
            info!(
                "Sync pass completed: {} delivered, {} retrying, {} dropped in {:?}",
                report.delivered, report.retried, report.dropped, report.duration
            );
        }

        self.state.write().await.record_pass(&report);
        self.events.emit(QueueEvent::PassFinished(report.clone()));

        Ok(PassOutcome::Completed(report))
    }

    async fn process(&self, action: PendingAction, report: &mut PassReport) -> Result<()> {
        if self.retry_policy.is_exhausted(action.retry_count) {
            warn!(
                "Dropping {} ({}): {} failed attempts already recorded",
                action.id, action.action_type, action.retry_count
            );
            return self
                .drop_action(action, DropReason::RetriesExhausted { last_error: None }, report)
                .await;
        }

        match self.dispatcher.dispatch(&action).await {
            DispatchOutcome::Delivered => {
                debug!("Delivered {} ({})", action.id, action.action_type);
                self.store.delete(&action.id).await?;
                report.delivered += 1;
                self.events.emit(QueueEvent::Delivered {
                    id: action.id,
                    action_type: action.action_type,
                });
            }
            DispatchOutcome::Transient(reason) => match self.retry_policy.decide(action.retry_count) {
                RetryDecision::Retry { retry_count } => {
                    warn!(
                        "Delivery of {} ({}) failed, attempt {}/{}: {}",
                        action.id, action.action_type, retry_count, self.retry_policy.max_retries, reason
                    );
                    let mut updated = action;
                    updated.retry_count = retry_count;
                    match self.store.put(&updated).await {
                        Ok(()) => {
                            report.retried += 1;
                            self.events.emit(QueueEvent::RetryScheduled {
                                id: updated.id,
                                action_type: updated.action_type,
                                retry_count,
                            });
                        }
                        Err(Error::NotFound(_)) => {
                            debug!("{} was removed during the pass", updated.id);
                        }
                        Err(e) => return Err(e),
                    }
                }
                RetryDecision::Exhausted => {
                    warn!(
                        "Dropping {} ({}) after {} failed attempts: {}",
                        action.id,
                        action.action_type,
                        action.retry_count.saturating_add(1),
                        reason
                    );
                    let mut dropped = action;
                    dropped.retry_count = dropped.retry_count.saturating_add(1);
                    self.drop_action(
                        dropped,
                        DropReason::RetriesExhausted {
                            last_error: Some(reason),
                        },
                        report,
                    )
                    .await?;
                }
            },
            DispatchOutcome::Fatal(reason) => {
                error!(
                    "Dropping {} ({}), it can never be delivered: {}",
                    action.id, action.action_type, reason
                );
                self.drop_action(action, DropReason::NoHandler { detail: reason }, report)
                    .await?;
            }
        }
        Ok(())
    }

    /// Move an action from the queue to the store's drop history.
    async fn drop_action(&self, action: PendingAction, reason: DropReason, report: &mut PassReport) -> Result<()> {
        let dropped = DroppedAction::now(action, reason);
        self.store.record_drop(&dropped).await?;
        report.dropped += 1;
        self.state.write().await.record_drop();
        self.events.emit(QueueEvent::Dropped(dropped));
        Ok(())
    }
}
