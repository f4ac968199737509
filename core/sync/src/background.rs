//! Background sync registration.
//!
//! Hosts that can run code without the foreground application expose a
//! "wake me for tag X" facility. The engine registers tags on every
//! enqueue; the host later runs a pass at its own discretion. Delivery
//! never happens here.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use outbox_common::{ActionType, Error, Result};

/// Tag registered for every enqueued action.
pub const SYNC_ALL_TAG: &str = "sync-pending-actions";

/// Tag registered for actions of one type, e.g. `sync-add-to-cart`.
pub fn action_tag(action_type: ActionType) -> String {
    format!("sync-{}", action_type.kebab_name())
}

/// Whether the host offers background execution at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundSupport {
    Supported,
    Unsupported,
}

/// Host facility for requesting background sync.
#[async_trait]
pub trait BackgroundTrigger: Send + Sync {
    /// Whether registration can succeed in this host.
    fn support(&self) -> BackgroundSupport;

    /// Ask the host to run a pass for `tag` later.
    ///
    /// # Errors
    /// - `Unsupported` if the host has no background facility
    /// - Any host-specific refusal (permission denied, shut down)
    async fn register(&self, tag: &str) -> Result<()>;
}

/// Trigger for hosts without background execution.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedTrigger;

#[async_trait]
impl BackgroundTrigger for UnsupportedTrigger {
    fn support(&self) -> BackgroundSupport {
        BackgroundSupport::Unsupported
    }

    async fn register(&self, tag: &str) -> Result<()> {
        Err(Error::Unsupported(format!("background sync for tag '{}'", tag)))
    }
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<BTreeSet<String>>,
    notify: Notify,
    host_closed: AtomicBool,
}

/// In-process background facility.
///
/// Registrations collect into a set shared with [`BackgroundRegistrations`],
/// which the host side (usually the scheduler) drains.
#[derive(Debug, Clone)]
pub struct ChannelTrigger {
    shared: Arc<Shared>,
}

impl ChannelTrigger {
    /// Create a trigger and the host-side receiver.
    pub fn new() -> (Self, BackgroundRegistrations) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: shared.clone(),
            },
            BackgroundRegistrations { shared },
        )
    }
}

#[async_trait]
impl BackgroundTrigger for ChannelTrigger {
    fn support(&self) -> BackgroundSupport {
        BackgroundSupport::Supported
    }

    async fn register(&self, tag: &str) -> Result<()> {
        // Host side gone: nobody will ever run the pass.
        if self.shared.host_closed.load(Ordering::Acquire) {
            return Err(Error::Unsupported("background host is shut down".to_string()));
        }

        let inserted = self
            .shared
            .pending
            .lock()
            .map_err(|_| Error::Storage("background registry lock poisoned".to_string()))?
            .insert(tag.to_string());
        if inserted {
            self.shared.notify.notify_one();
        }
        Ok(())
    }
}

/// Host side of a [`ChannelTrigger`].
#[derive(Debug)]
pub struct BackgroundRegistrations {
    shared: Arc<Shared>,
}

impl BackgroundRegistrations {
    /// Wait until at least one tag is registered, then take all of them.
    pub async fn next_batch(&self) -> Vec<String> {
        loop {
            let batch = self.take_pending();
            if !batch.is_empty() {
                return batch;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Tags registered and not yet taken.
    pub fn pending(&self) -> Vec<String> {
        match self.shared.pending.lock() {
            Ok(pending) => pending.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn take_pending(&self) -> Vec<String> {
        match self.shared.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending).into_iter().collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for BackgroundRegistrations {
    fn drop(&mut self) {
        self.shared.host_closed.store(true, Ordering::Release);
    }
}
