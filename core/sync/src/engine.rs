//! Client-facing queue engine.
//!
//! [`SyncEngine`] is the only type application code needs: it captures
//! actions, exposes the queue for display and runs passes on demand. Every
//! handle is cheap to clone and shares the same queue.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use outbox_common::{ActionId, ActionType, PendingAction, Priority, Result};
use outbox_store::QueueStore;

use crate::background::{action_tag, BackgroundRegistrations, BackgroundTrigger, UnsupportedTrigger, SYNC_ALL_TAG};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivitySubscription};
use crate::coordinator::{PassOutcome, SyncCoordinator};
use crate::dispatcher::ActionDispatcher;
use crate::events::{EventBus, EventSubscription, QueueEvent};
use crate::scheduler::{wait_until, SyncMode, SyncScheduler};
use crate::state::{QueueState, QueueStatus};

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: Arc<dyn QueueStore>,
    dispatcher: ActionDispatcher,
    connectivity: Option<ConnectivityMonitor>,
    background: Option<Arc<dyn BackgroundTrigger>>,
    config: SyncConfig,
}

impl SyncEngineBuilder {
    /// Share an existing connectivity monitor. Defaults to a fresh one
    /// reporting online.
    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.connectivity = Some(monitor);
        self
    }

    /// Host background facility. Defaults to [`UnsupportedTrigger`].
    pub fn background(mut self, trigger: Arc<dyn BackgroundTrigger>) -> Self {
        self.background = Some(trigger);
        self
    }

    /// Engine configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    ///
    /// The configured dispatch timeout replaces any timeout set on the
    /// dispatcher. When called inside a tokio runtime, a task is started
    /// that runs a pass `reconnect_delay` after connectivity comes back; it
    /// stops when the last engine handle is dropped.
    pub fn build(self) -> SyncEngine {
        let connectivity = self.connectivity.unwrap_or_default();
        let background = self
            .background
            .unwrap_or_else(|| Arc::new(UnsupportedTrigger));
        let state = Arc::new(RwLock::new(QueueState::new()));
        let events = EventBus::default();
        let dispatcher = Arc::new(self.dispatcher.with_timeout(self.config.dispatch_timeout));

        let coordinator = Arc::new(SyncCoordinator::new(
            self.store.clone(),
            dispatcher,
            connectivity.clone(),
            self.config.retry_policy(),
            state.clone(),
            events.clone(),
        ));

        let reconnect_task = match Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(reconnect_loop(
                connectivity.subscribe(),
                coordinator.clone(),
                self.config.reconnect_delay,
            ))),
            Err(_) => {
                debug!("No runtime, reconnect passes disabled");
                None
            }
        };

        SyncEngine {
            inner: Arc::new(EngineInner {
                store: self.store,
                coordinator,
                connectivity,
                background,
                state,
                events,
                config: self.config,
                reconnect_task,
            }),
        }
    }
}

/// Run a pass `delay` after each return to online.
///
/// Going offline again inside the window cancels the pass.
async fn reconnect_loop(mut subscription: ConnectivitySubscription, coordinator: Arc<SyncCoordinator>, delay: Duration) {
    let mut due: Option<Instant> = None;
    loop {
        tokio::select! {
            change = subscription.changed() => match change {
                Some(true) => {
                    debug!("Back online, pass in {:?}", delay);
                    due = Some(Instant::now() + delay);
                }
                Some(false) => due = None,
                None => break,
            },
            _ = wait_until(due) => {
                due = None;
                if let Err(e) = coordinator.run_pass().await {
                    error!("Reconnect sync pass failed: {}", e);
                }
            }
        }
    }
}

struct EngineInner {
    store: Arc<dyn QueueStore>,
    coordinator: Arc<SyncCoordinator>,
    connectivity: ConnectivityMonitor,
    background: Arc<dyn BackgroundTrigger>,
    state: Arc<RwLock<QueueState>>,
    events: EventBus,
    config: SyncConfig,
    reconnect_task: Option<JoinHandle<()>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

/// Offline action queue with automatic delivery.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Start building an engine over `store`, delivering through `dispatcher`.
    pub fn builder(store: Arc<dyn QueueStore>, dispatcher: ActionDispatcher) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            dispatcher,
            connectivity: None,
            background: None,
            config: SyncConfig::default(),
        }
    }

    /// Capture an action for delivery.
    ///
    /// The action is durable once this returns. Background registration
    /// failures are logged and otherwise ignored. While online, and unless
    /// disabled in the config, a pass is started right away without waiting
    /// for it.
    ///
    /// # Errors
    /// - The store could not record the action
    pub async fn enqueue(&self, action_type: ActionType, payload: Value, priority: Priority) -> Result<ActionId> {
        let action = PendingAction::new(action_type, payload, priority);
        self.inner.store.add(&action).await?;
        info!("Queued {} ({}, {} priority)", action.id, action_type, priority);

        self.register_background(action_type).await;
        self.inner.events.emit(QueueEvent::Enqueued {
            id: action.id.clone(),
            action_type,
        });

        if self.inner.config.sync_on_enqueue && self.inner.connectivity.is_online() {
            self.spawn_pass();
        }

        Ok(action.id)
    }

    /// Capture an action named by its wire type, e.g. `"ADD_TO_CART"`.
    ///
    /// # Errors
    /// - `UnknownActionType` if the name is not a known type; nothing is stored
    /// - The store could not record the action
    pub async fn enqueue_named(&self, action_type: &str, payload: Value, priority: Priority) -> Result<ActionId> {
        let action_type: ActionType = action_type.parse()?;
        self.enqueue(action_type, payload, priority).await
    }

    /// Pending actions in dispatch order.
    pub async fn list_pending(&self) -> Result<Vec<PendingAction>> {
        self.inner.store.get_all_by_priority().await
    }

    /// Number of pending actions.
    pub async fn count_pending(&self) -> Result<usize> {
        self.inner.store.count().await
    }

    /// Run a pass now and wait for it.
    ///
    /// Returns `false` if the pass was skipped because the device is offline
    /// or another pass is already running.
    ///
    /// # Errors
    /// - Store read or write failures
    pub async fn sync_now(&self) -> Result<bool> {
        Ok(self.inner.coordinator.run_pass().await?.is_completed())
    }

    /// Run a pass now and return the full outcome.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        self.inner.coordinator.run_pass().await
    }

    /// Remove every pending action without delivering it.
    pub async fn clear_all(&self) -> Result<()> {
        self.inner.store.clear().await?;
        info!("Cleared all pending actions");
        self.inner.events.emit(QueueEvent::Cleared);
        Ok(())
    }

    /// Forget the store's drop history.
    pub async fn clear_dropped(&self) -> Result<()> {
        self.inner.store.clear_drops().await?;
        info!("Cleared drop history");
        Ok(())
    }

    /// Snapshot of the queue for display.
    ///
    /// Drops come from the store, so they include those made by any other
    /// engine sharing it. The last pass is this engine's own.
    pub async fn status(&self) -> Result<QueueStatus> {
        let pending = self.inner.store.get_all_by_priority().await?;
        let recently_dropped = self.inner.store.recent_drops().await?;
        let state = self.inner.state.read().await;
        Ok(QueueStatus {
            pending,
            recently_dropped,
            last_pass: state.last_pass.clone(),
            last_pass_at: state.last_pass_at,
            sync_in_progress: self.inner.coordinator.is_running(),
            online: self.inner.connectivity.is_online(),
        })
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Connectivity monitor the engine consults.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Underlying pass coordinator.
    pub fn coordinator(&self) -> Arc<SyncCoordinator> {
        self.inner.coordinator.clone()
    }

    /// Start a scheduler running passes for this engine.
    ///
    /// The scheduler runs a pass for each batch of `background`
    /// registrations if given. Reconnect passes are left to the engine
    /// itself.
    pub fn spawn_scheduler(
        &self,
        mode: SyncMode,
        background: Option<BackgroundRegistrations>,
    ) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(mode);
        let mut handle = handle.with_retry_policy(self.inner.coordinator.retry_policy().clone());
        if let Some(registrations) = background {
            handle = handle.with_background(registrations);
        }

        let coordinator = self.inner.coordinator.clone();
        let task = tokio::spawn(handle.run(move |trigger| {
            let coordinator = coordinator.clone();
            async move {
                debug!("Scheduled pass: {:?}", trigger);
                coordinator.run_pass().await
            }
        }));

        (scheduler, task)
    }

    async fn register_background(&self, action_type: ActionType) {
        let background = &self.inner.background;
        for tag in [SYNC_ALL_TAG.to_string(), action_tag(action_type)] {
            if let Err(e) = background.register(&tag).await {
                debug!("Background sync registration for '{}' failed: {}", tag, e);
            }
        }
    }

    fn spawn_pass(&self) {
        let coordinator = self.inner.coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_pass().await {
                error!("Sync pass after enqueue failed: {}", e);
            }
        });
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.inner.store.name())
            .field("online", &self.inner.connectivity.is_online())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::ChannelTrigger;
    use crate::dispatcher::handler_fn;
    use outbox_common::Error;
    use outbox_store::MemoryStore;
    use serde_json::json;

    fn quiet_config() -> SyncConfig {
        SyncConfig {
            sync_on_enqueue: false,
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_registers_background_tags() {
        let (trigger, registrations) = ChannelTrigger::new();
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), ActionDispatcher::new())
            .background(Arc::new(trigger))
            .config(quiet_config())
            .build();

        engine
            .enqueue(ActionType::AddToCart, json!({"ticket": 3}), Priority::High)
            .await
            .unwrap();
        engine
            .enqueue(ActionType::AddToCart, json!({"ticket": 4}), Priority::High)
            .await
            .unwrap();

        assert_eq!(
            registrations.pending(),
            vec!["sync-add-to-cart".to_string(), SYNC_ALL_TAG.to_string()]
        );
    }

    #[tokio::test]
    async fn test_background_failure_does_not_fail_enqueue() {
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), ActionDispatcher::new())
            .config(quiet_config())
            .build();
        engine
            .enqueue(ActionType::LikePost, json!({}), Priority::Low)
            .await
            .unwrap();
        assert_eq!(engine.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_named_rejects_unknown() {
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), ActionDispatcher::new())
            .config(quiet_config())
            .build();

        let result = engine.enqueue_named("DELETE_ACCOUNT", json!({}), Priority::Medium).await;
        assert!(matches!(result, Err(Error::UnknownActionType(_))));
        assert_eq!(engine.count_pending().await.unwrap(), 0);

        engine
            .enqueue_named("save-draft", json!({}), Priority::Medium)
            .await
            .unwrap();
        assert_eq!(engine.list_pending().await.unwrap()[0].action_type, ActionType::SaveDraft);
    }

    #[tokio::test]
    async fn test_enqueue_emits_event_and_syncs() {
        let mut dispatcher = ActionDispatcher::new();
        dispatcher
            .register(ActionType::PostComment, handler_fn(|_| async { Ok(()) }))
            .unwrap();
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher).build();
        let mut events = engine.subscribe();

        let id = engine
            .enqueue(ActionType::PostComment, json!({"text": "see you there"}), Priority::Medium)
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(QueueEvent::Enqueued { id: ref e, .. }) if *e == id));
        assert!(matches!(events.recv().await, Some(QueueEvent::Delivered { id: ref d, .. }) if *d == id));
        assert!(matches!(events.recv().await, Some(QueueEvent::PassFinished(_))));
        assert_eq!(engine.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), ActionDispatcher::new())
            .config(quiet_config())
            .build();
        let mut events = engine.subscribe();
        engine
            .enqueue(ActionType::RateProduct, json!({"stars": 5}), Priority::Low)
            .await
            .unwrap();

        engine.clear_all().await.unwrap();
        assert_eq!(engine.count_pending().await.unwrap(), 0);
        assert!(matches!(events.recv().await, Some(QueueEvent::Enqueued { .. })));
        assert!(matches!(events.recv().await, Some(QueueEvent::Cleared)));
    }

    #[tokio::test]
    async fn test_clear_dropped_keeps_pending() {
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), ActionDispatcher::new())
            .config(quiet_config())
            .build();
        engine
            .enqueue(ActionType::SaveDraft, json!({"body": "draft"}), Priority::Low)
            .await
            .unwrap();
        assert!(engine.sync_now().await.unwrap());
        engine
            .enqueue(ActionType::LikePost, json!({}), Priority::Low)
            .await
            .unwrap();
        assert_eq!(engine.status().await.unwrap().recently_dropped.len(), 1);

        engine.clear_dropped().await.unwrap();
        let status = engine.status().await.unwrap();
        assert!(status.recently_dropped.is_empty());
        assert_eq!(status.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_status_reflects_connectivity() {
        let monitor = ConnectivityMonitor::new(false);
        let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), ActionDispatcher::new())
            .connectivity(monitor.clone())
            .build();
        engine
            .enqueue(ActionType::UpdateProfile, json!({"name": "Sam"}), Priority::Medium)
            .await
            .unwrap();

        let status = engine.status().await.unwrap();
        assert!(!status.online);
        assert!(!status.sync_in_progress);
        assert_eq!(status.pending.len(), 1);
        assert!(status.last_pass.is_none());
        assert!(!engine.sync_now().await.unwrap());
    }
}
