//! End-to-end queue behavior through the public engine API.

use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::timeout;

use outbox_common::{ActionType, Error, Priority};
use outbox_store::{MemoryStore, QueueStore, SqliteStore};
use outbox_sync::{
    handler_fn, ActionDispatcher, ConnectivityMonitor, DropReason, PassOutcome, QueueEvent, SkipReason,
    SyncConfig, SyncEngine, SyncMode,
};

fn manual_config() -> SyncConfig {
    SyncConfig {
        sync_on_enqueue: false,
        ..SyncConfig::default()
    }
}

fn counting_dispatcher(action_type: ActionType, fail: bool) -> (ActionDispatcher, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let mut dispatcher = ActionDispatcher::new();
    dispatcher
        .register(
            action_type,
            handler_fn(move |_| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(Error::Network("500 Internal Server Error".to_string()))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .unwrap();
    (dispatcher, calls)
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.db");

    let id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine = SyncEngine::builder(store, ActionDispatcher::new())
            .connectivity(ConnectivityMonitor::new(false))
            .build();
        engine
            .enqueue(ActionType::SubmitForm, json!({"form": "rsvp", "guests": 2}), Priority::High)
            .await
            .unwrap()
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let engine = SyncEngine::builder(store, ActionDispatcher::new())
        .config(manual_config())
        .build();
    let pending = engine.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].payload["guests"], 2);
    assert_eq!(pending[0].priority, Priority::High);
}

#[tokio::test]
async fn test_priority_order_independent_of_enqueue_order() {
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), ActionDispatcher::new())
        .config(manual_config())
        .build();

    engine.enqueue(ActionType::LikePost, json!({}), Priority::Low).await.unwrap();
    engine.enqueue(ActionType::SaveDraft, json!({}), Priority::Medium).await.unwrap();
    engine.enqueue(ActionType::AddToCart, json!({}), Priority::High).await.unwrap();

    let order: Vec<_> = engine
        .list_pending()
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.priority)
        .collect();
    assert_eq!(order, vec![Priority::High, Priority::Medium, Priority::Low]);
}

#[tokio::test]
async fn test_retry_budget_is_five_attempts() {
    let (dispatcher, calls) = counting_dispatcher(ActionType::AddToCart, true);
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher)
        .config(manual_config())
        .build();
    engine
        .enqueue(ActionType::AddToCart, json!({"ticket": "GA-1"}), Priority::High)
        .await
        .unwrap();

    for pass in 1..=4u32 {
        assert!(engine.sync_now().await.unwrap());
        let pending = engine.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, pass);
    }

    assert!(engine.sync_now().await.unwrap());
    assert_eq!(engine.count_pending().await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let status = engine.status().await.unwrap();
    assert_eq!(status.recently_dropped.len(), 1);
    assert!(matches!(
        status.recently_dropped[0].reason,
        DropReason::RetriesExhausted { .. }
    ));
}

#[tokio::test]
async fn test_unknown_type_rejected_and_not_persisted() {
    let store = Arc::new(MemoryStore::new());
    let engine = SyncEngine::builder(store.clone(), ActionDispatcher::new())
        .config(manual_config())
        .build();

    let result = engine.enqueue_named("TRANSFER_TICKET", json!({}), Priority::Medium).await;
    assert!(matches!(result, Err(Error::UnknownActionType(name)) if name == "TRANSFER_TICKET"));
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_no_second_pass_while_one_runs() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicU32::new(0));

    let mut dispatcher = ActionDispatcher::new();
    {
        let started = started.clone();
        let release = release.clone();
        let calls = calls.clone();
        dispatcher
            .register(
                ActionType::PostComment,
                handler_fn(move |_| {
                    let started = started.clone();
                    let release = release.clone();
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        started.notify_one();
                        release.notified().await;
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }

    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher)
        .config(manual_config())
        .build();
    engine
        .enqueue(ActionType::PostComment, json!({"text": "first!"}), Priority::Medium)
        .await
        .unwrap();

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sync_now().await })
    };
    started.notified().await;

    assert!(engine.status().await.unwrap().sync_in_progress);
    assert_eq!(
        engine.run_pass().await.unwrap(),
        PassOutcome::Skipped(SkipReason::AlreadyRunning)
    );
    assert!(!engine.sync_now().await.unwrap());

    release.notify_one();
    assert!(slow.await.unwrap().unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.count_pending().await.unwrap(), 0);
}

#[tokio::test]
async fn test_offline_pass_leaves_queue_untouched() {
    let (dispatcher, calls) = counting_dispatcher(ActionType::BookmarkEvent, false);
    let monitor = ConnectivityMonitor::new(false);
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher)
        .connectivity(monitor)
        .build();
    engine
        .enqueue(ActionType::BookmarkEvent, json!({"event": 42}), Priority::Low)
        .await
        .unwrap();

    assert!(!engine.sync_now().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let pending = engine.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0);
}

#[tokio::test]
async fn test_successful_delivery_removes_entry() {
    let (dispatcher, calls) = counting_dispatcher(ActionType::RateProduct, false);
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher)
        .config(manual_config())
        .build();
    engine
        .enqueue(ActionType::RateProduct, json!({"stars": 4}), Priority::Medium)
        .await
        .unwrap();

    assert!(engine.sync_now().await.unwrap());
    assert_eq!(engine.count_pending().await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let status = engine.status().await.unwrap();
    let report = status.last_pass.unwrap();
    assert_eq!(report.delivered, 1);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_unhandled_type_dropped_and_visible() {
    let (dispatcher, _calls) = counting_dispatcher(ActionType::LikePost, false);
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher)
        .config(manual_config())
        .build();
    let mut events = engine.subscribe();

    let id = engine
        .enqueue(ActionType::UpdateProfile, json!({"bio": "live music fan"}), Priority::Medium)
        .await
        .unwrap();
    assert!(engine.sync_now().await.unwrap());

    assert_eq!(engine.count_pending().await.unwrap(), 0);
    let status = engine.status().await.unwrap();
    assert_eq!(status.recently_dropped.len(), 1);
    let dropped = &status.recently_dropped[0];
    assert_eq!(dropped.id, id);
    assert_eq!(dropped.retry_count, 0);
    assert!(matches!(dropped.reason, DropReason::NoHandler { .. }));

    assert!(matches!(events.recv().await, Some(QueueEvent::Enqueued { .. })));
    assert!(matches!(events.recv().await, Some(QueueEvent::Dropped(_))));
}

#[tokio::test]
async fn test_drops_visible_to_other_engine_on_same_queue() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.db");

    let id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let background = SyncEngine::builder(store, ActionDispatcher::new())
            .config(manual_config())
            .build();
        let id = background
            .enqueue(ActionType::PostComment, json!({"text": "great set"}), Priority::Medium)
            .await
            .unwrap();
        assert!(background.sync_now().await.unwrap());
        id
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let foreground = SyncEngine::builder(store, ActionDispatcher::new())
        .config(manual_config())
        .build();
    let status = foreground.status().await.unwrap();
    assert!(status.pending.is_empty());
    assert_eq!(status.recently_dropped.len(), 1);
    assert_eq!(status.recently_dropped[0].id, id);
    assert_eq!(status.recently_dropped[0].action_type, "POST_COMMENT");
    assert!(matches!(
        status.recently_dropped[0].reason,
        DropReason::NoHandler { .. }
    ));
}

#[tokio::test]
async fn test_failed_actions_stay_in_sqlite_with_retry_count() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("queue.db");
    let (dispatcher, _calls) = counting_dispatcher(ActionType::SaveDraft, true);

    {
        let engine = SyncEngine::builder(Arc::new(SqliteStore::open(&path).unwrap()), dispatcher)
            .config(manual_config())
            .build();
        engine
            .enqueue(ActionType::SaveDraft, json!({"body": "..."}), Priority::Low)
            .await
            .unwrap();
        engine.sync_now().await.unwrap();
        engine.sync_now().await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let pending = store.get_all().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 2);
}

#[tokio::test]
async fn test_reconnect_triggers_debounced_pass() {
    let (dispatcher, calls) = counting_dispatcher(ActionType::AddToCart, false);
    let monitor = ConnectivityMonitor::new(false);
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher)
        .connectivity(monitor.clone())
        .config(SyncConfig {
            reconnect_delay: Duration::from_millis(50),
            ..SyncConfig::default()
        })
        .build();

    engine
        .enqueue(ActionType::AddToCart, json!({"ticket": "VIP-9"}), Priority::High)
        .await
        .unwrap();
    assert_eq!(engine.count_pending().await.unwrap(), 1);

    // Flapping back offline inside the window cancels the pass.
    monitor.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    monitor.set_online(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    monitor.set_online(true);
    timeout(Duration::from_secs(2), async {
        while engine.count_pending().await.unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scheduler_request_sync_runs_engine_pass() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = ActionDispatcher::new();
    {
        let order = order.clone();
        dispatcher
            .register(
                ActionType::SubmitForm,
                handler_fn(move |a| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(a.priority);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), dispatcher)
        .config(manual_config())
        .build();
    for priority in [Priority::Low, Priority::High, Priority::Medium] {
        engine
            .enqueue(ActionType::SubmitForm, json!({}), priority)
            .await
            .unwrap();
    }

    let (scheduler, task) = engine.spawn_scheduler(SyncMode::Manual, None);
    let outcome = scheduler.request_sync().await.unwrap();
    assert_eq!(outcome.report().unwrap().delivered, 3);
    assert_eq!(
        *order.lock().unwrap(),
        vec![Priority::High, Priority::Medium, Priority::Low]
    );

    scheduler.shutdown().await;
    task.await.unwrap();
}
