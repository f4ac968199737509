//! Action delivery and outcome classification.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use outbox_common::{ActionType, Error, PendingAction, Result};

/// Delivers one kind of action to the server.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Apply the action remotely.
    ///
    /// Any error counts as a transient failure; the action is retried on a
    /// later pass until its budget runs out.
    async fn apply(&self, action: &PendingAction) -> Result<()>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(PendingAction) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn apply(&self, action: &PendingAction) -> Result<()> {
        (self.f)(action.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(PendingAction) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// How a delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The server accepted the action.
    Delivered,
    /// The attempt failed; a later attempt may succeed.
    Transient(String),
    /// No attempt can ever succeed.
    Fatal(String),
}

/// Mapping table from action type to handler.
///
/// Built once at startup; dispatch never mutates the action it is given.
#[derive(Clone, Default)]
pub struct ActionDispatcher {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
    timeout: Option<Duration>,
}

impl ActionDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every delivery attempt by `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register the handler for an action type.
    ///
    /// # Errors
    /// - Returns error if the type already has a handler
    pub fn register(&mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) -> Result<()> {
        if self.handlers.contains_key(&action_type) {
            return Err(Error::AlreadyExists(format!(
                "Handler for {} is already registered",
                action_type
            )));
        }
        self.handlers.insert(action_type, handler);
        Ok(())
    }

    /// Check if a type has a handler.
    pub fn has_handler(&self, action_type: ActionType) -> bool {
        self.handlers.contains_key(&action_type)
    }

    /// Types with a registered handler.
    pub fn action_types(&self) -> Vec<ActionType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Attempt delivery and classify the result.
    pub async fn dispatch(&self, action: &PendingAction) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&action.action_type) else {
            return DispatchOutcome::Fatal(format!(
                "no handler registered for {}",
                action.action_type
            ));
        };

        debug!("Dispatching {} ({})", action.id, action.action_type);

        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.apply(action)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!("delivery exceeded {:?}", limit))),
            },
            None => handler.apply(action).await,
        };

        match result {
            Ok(()) => DispatchOutcome::Delivered,
            Err(e) => DispatchOutcome::Transient(e.to_string()),
        }
    }
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("action_types", &self.action_types())
            .field("timeout", &self.timeout)
            .finish()
    }
}
