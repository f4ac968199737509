//! Sync scheduling - manual, periodic, reconnect and background passes.

use serde::{Deserialize, Serialize};
use std::future::{pending, Future};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use outbox_common::{Error, Result};

use crate::background::BackgroundRegistrations;
use crate::connectivity::ConnectivitySubscription;
use crate::coordinator::PassOutcome;
use crate::retry::RetryPolicy;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Passes only on request, reconnect or background wake-up.
    Manual,
    /// Additionally pass at regular intervals and retry failures with backoff.
    Periodic { interval: Duration },
}

/// What caused a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Explicit request through [`SyncScheduler::request_sync`].
    Manual,
    /// Periodic timer.
    Periodic,
    /// Connectivity came back.
    Reconnect,
    /// The background facility fired for these tags.
    Background(Vec<String>),
    /// Follow-up for actions left behind by an earlier pass.
    Retry,
}

enum SyncRequest {
    Pass(oneshot::Sender<Result<PassOutcome>>),
    Shutdown,
}

/// Client side of a running scheduler.
#[derive(Debug, Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SyncRequest>,
}

impl std::fmt::Debug for SyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncRequest::Pass(_) => f.write_str("Pass"),
            SyncRequest::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);

        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            connectivity: None,
            background: None,
            reconnect_delay: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        };

        (Self { request_tx }, handle)
    }

    /// Run a pass through the scheduler and wait for its outcome.
    ///
    /// # Errors
    /// - `Shutdown` if the scheduler is not running
    /// - Any error from the pass itself
    pub async fn request_sync(&self) -> Result<PassOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SyncRequest::Pass(response_tx))
            .await
            .map_err(|_| Error::Shutdown("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Shutdown("Scheduler stopped before the pass finished".to_string()))?
    }

    /// Whether the runner has exited.
    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    /// Stop the scheduler. A pass already running finishes first.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SyncRequest::Shutdown).await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: SyncMode,
    request_rx: mpsc::Receiver<SyncRequest>,
    connectivity: Option<ConnectivitySubscription>,
    background: Option<BackgroundRegistrations>,
    reconnect_delay: Duration,
    retry_policy: RetryPolicy,
}

/// Wake-up reasons inside the run loop.
enum Event {
    Request(Option<SyncRequest>),
    Tick,
    Connectivity(Option<bool>),
    ReconnectDue,
    Background(Vec<String>),
    RetryDue,
}

impl SyncSchedulerHandle {
    /// Run a debounced pass whenever connectivity comes back.
    pub fn with_connectivity(mut self, subscription: ConnectivitySubscription) -> Self {
        self.connectivity = Some(subscription);
        self
    }

    /// Run a pass whenever background tags are registered.
    pub fn with_background(mut self, registrations: BackgroundRegistrations) -> Self {
        self.background = Some(registrations);
        self
    }

    /// Delay between coming back online and the reconnect pass.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Backoff used for follow-up passes.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` runs one pass and
    /// is never called concurrently with itself. Returns after
    /// [`SyncScheduler::shutdown`] or once every [`SyncScheduler`] is dropped.
    pub async fn run<F, Fut>(self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PassOutcome>> + Send,
    {
        let SyncSchedulerHandle {
            mode,
            mut request_rx,
            mut connectivity,
            background,
            reconnect_delay,
            retry_policy,
        } = self;

        let mut periodic = periodic_interval(&mode);
        let mut reconnect_at: Option<Instant> = None;
        let mut retry_at: Option<Instant> = None;
        let mut retry_attempt: u32 = 0;

        info!("Sync scheduler started ({:?})", mode);

        loop {
            let event = tokio::select! {
                request = request_rx.recv() => Event::Request(request),
                _ = wait_tick(&mut periodic) => Event::Tick,
                online = wait_connectivity(&mut connectivity) => Event::Connectivity(online),
                _ = wait_until(reconnect_at) => Event::ReconnectDue,
                tags = wait_background(background.as_ref()) => Event::Background(tags),
                _ = wait_until(retry_at) => Event::RetryDue,
            };

            let (trigger, response_tx) = match event {
                Event::Request(None) | Event::Request(Some(SyncRequest::Shutdown)) => {
                    info!("Sync scheduler shutting down");
                    break;
                }
                Event::Request(Some(SyncRequest::Pass(response_tx))) => (SyncTrigger::Manual, Some(response_tx)),
                Event::Tick => (SyncTrigger::Periodic, None),
                Event::Connectivity(Some(true)) => {
                    debug!("Back online, pass in {:?}", reconnect_delay);
                    reconnect_at = Some(Instant::now() + reconnect_delay);
                    continue;
                }
                Event::Connectivity(Some(false)) => {
                    reconnect_at = None;
                    continue;
                }
                Event::Connectivity(None) => {
                    debug!("Connectivity monitor gone");
                    connectivity = None;
                    continue;
                }
                Event::ReconnectDue => {
                    reconnect_at = None;
                    (SyncTrigger::Reconnect, None)
                }
                Event::Background(tags) => (SyncTrigger::Background(tags), None),
                Event::RetryDue => {
                    retry_at = None;
                    (SyncTrigger::Retry, None)
                }
            };

            debug!("Triggering sync pass: {:?}", trigger);
            let result = sync_fn(trigger.clone()).await;

            match &result {
                Ok(PassOutcome::Completed(report)) if mode != SyncMode::Manual => {
                    if report.is_clean() {
                        retry_attempt = 0;
                        retry_at = None;
                    } else {
                        let delay = retry_policy.delay_for_attempt(retry_attempt);
                        retry_attempt = retry_attempt.saturating_add(1);
                        debug!("{} actions left behind, follow-up pass in {:?}", report.retried, delay);
                        retry_at = Some(Instant::now() + delay);
                    }
                }
                Ok(_) => {}
                Err(e) => error!("Sync pass ({:?}) failed: {}", trigger, e),
            }

            if let Some(response_tx) = response_tx {
                let _ = response_tx.send(result);
            }
        }
    }
}

fn periodic_interval(mode: &SyncMode) -> Option<Interval> {
    match mode {
        SyncMode::Periodic { interval } if !interval.is_zero() => {
            let mut timer = interval_at(Instant::now() + *interval, *interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(timer)
        }
        _ => None,
    }
}

async fn wait_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

async fn wait_connectivity(subscription: &mut Option<ConnectivitySubscription>) -> Option<bool> {
    match subscription {
        Some(subscription) => subscription.changed().await,
        None => pending().await,
    }
}

pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn wait_background(registrations: Option<&BackgroundRegistrations>) -> Vec<String> {
    match registrations {
        Some(registrations) => registrations.next_batch().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{BackgroundTrigger, ChannelTrigger, SYNC_ALL_TAG};
    use crate::connectivity::ConnectivityMonitor;
    use crate::coordinator::PassReport;
    use std::sync::{Arc, Mutex};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    type Log = Arc<Mutex<Vec<SyncTrigger>>>;

    fn spawn_recording(handle: SyncSchedulerHandle, retried_first: usize) -> (Log, JoinHandle<()>) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        let task = tokio::spawn(handle.run(move |trigger| {
            let seen = seen.clone();
            async move {
                let mut log = seen.lock().unwrap();
                let retried = if log.is_empty() { retried_first } else { 0 };
                log.push(trigger);
                Ok(PassOutcome::Completed(PassReport {
                    retried,
                    ..PassReport::default()
                }))
            }
        }));
        (log, task)
    }

    async fn wait_for(log: &Log, count: usize) {
        timeout(Duration::from_secs(2), async {
            while log.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_sync_request() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let (log, task) = spawn_recording(handle, 0);

        let outcome = scheduler.request_sync().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(*log.lock().unwrap(), vec![SyncTrigger::Manual]);

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(scheduler.is_closed());
        assert!(matches!(scheduler.request_sync().await, Err(Error::Shutdown(_))));
    }

    #[tokio::test]
    async fn test_runner_exits_when_clients_dropped() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let (_log, task) = spawn_recording(handle, 0);
        drop(scheduler);
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_periodic_pass() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic {
            interval: Duration::from_millis(20),
        });
        let (log, task) = spawn_recording(handle, 0);

        wait_for(&log, 2).await;
        assert!(log.lock().unwrap().iter().all(|t| *t == SyncTrigger::Periodic));

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_pass_is_debounced() {
        let monitor = ConnectivityMonitor::new(false);
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let handle = handle
            .with_connectivity(monitor.subscribe())
            .with_reconnect_delay(Duration::from_millis(50));
        let (log, task) = spawn_recording(handle, 0);

        // A flap shorter than the delay cancels the pending pass.
        monitor.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.set_online(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(log.lock().unwrap().is_empty());

        monitor.set_online(true);
        wait_for(&log, 1).await;
        assert_eq!(*log.lock().unwrap(), vec![SyncTrigger::Reconnect]);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_background_registration_runs_pass() {
        let (trigger, registrations) = ChannelTrigger::new();
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let (log, task) = spawn_recording(handle.with_background(registrations), 0);

        trigger.register(SYNC_ALL_TAG).await.unwrap();
        wait_for(&log, 1).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![SyncTrigger::Background(vec![SYNC_ALL_TAG.to_string()])]
        );

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_follow_up_after_unclean_pass() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Periodic {
            interval: Duration::from_secs(3600),
        });
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false);
        let (log, task) = spawn_recording(handle.with_retry_policy(policy), 1);

        scheduler.request_sync().await.unwrap();
        wait_for(&log, 2).await;
        assert_eq!(*log.lock().unwrap(), vec![SyncTrigger::Manual, SyncTrigger::Retry]);

        // The follow-up was clean, so nothing else is scheduled.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.lock().unwrap().len(), 2);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_mode_has_no_follow_up() {
        let (scheduler, handle) = SyncScheduler::new(SyncMode::Manual);
        let policy = RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false);
        let (log, task) = spawn_recording(handle.with_retry_policy(policy), 1);

        scheduler.request_sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.lock().unwrap().len(), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[test]
    fn test_mode_serialization() {
        let mode = SyncMode::Periodic {
            interval: Duration::from_secs(60),
        };
        let json = serde_json::to_string(&mode).unwrap();
        let restored: SyncMode = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, mode);
    }
}
