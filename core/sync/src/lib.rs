//! Outbox Sync Engine
//!
//! This module delivers queued actions to the server, including:
//! - Sequential sync passes with a per-action retry budget
//! - Connectivity tracking and reconnect passes
//! - Background sync registration
//! - Scheduling with periodic passes and backoff follow-ups
//! - HTTP delivery with idempotency keys

pub mod background;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod http;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use background::{
    action_tag, BackgroundRegistrations, BackgroundSupport, BackgroundTrigger, ChannelTrigger,
    UnsupportedTrigger, SYNC_ALL_TAG,
};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivitySubscription};
pub use coordinator::{PassOutcome, PassReport, SkipReason, SyncCoordinator};
pub use dispatcher::{handler_fn, ActionDispatcher, ActionHandler, DispatchOutcome};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use events::{EventBus, EventSubscription, QueueEvent};
pub use http::{HttpEndpoints, HttpHandler};
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use state::{DropReason, DroppedAction, QueueState, QueueStatus};
