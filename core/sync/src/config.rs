//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use outbox_common::{Error, Result};

use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::scheduler::SyncMode;

/// Configuration for the sync engine.
///
/// Every field has a default, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum failed attempts per action before it is dropped.
    pub max_retries: u32,
    /// Delay between coming back online and the reconnect pass.
    pub reconnect_delay: Duration,
    /// Upper bound for a single delivery attempt.
    pub dispatch_timeout: Option<Duration>,
    /// Start a pass right after enqueueing while online.
    pub sync_on_enqueue: bool,
    /// How many dropped actions the store remembers for display.
    ///
    /// Applied by whoever opens the store, e.g. `SqliteStore::with_drop_history`.
    pub dropped_history: usize,
    /// Scheduler mode.
    pub sync_mode: SyncMode,
    /// First backoff delay for follow-up passes.
    pub backoff_initial_delay: Duration,
    /// Cap for follow-up pass backoff.
    pub backoff_max_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            reconnect_delay: Duration::from_secs(1),
            dispatch_timeout: Some(Duration::from_secs(30)),
            sync_on_enqueue: true,
            dropped_history: 50,
            sync_mode: SyncMode::Manual,
            backoff_initial_delay: Duration::from_secs(2),
            backoff_max_delay: Duration::from_secs(300),
        }
    }
}

impl SyncConfig {
    /// Load a JSON configuration file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid JSON for this structure
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidInput("max_retries must be at least 1".to_string()));
        }
        if self.backoff_initial_delay > self.backoff_max_delay {
            return Err(Error::InvalidInput(
                "backoff_initial_delay exceeds backoff_max_delay".to_string(),
            ));
        }
        if let SyncMode::Periodic { interval } = self.sync_mode {
            if interval.is_zero() {
                return Err(Error::InvalidInput("periodic interval must be non-zero".to_string()));
            }
        }
        Ok(())
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_initial_delay(self.backoff_initial_delay)
            .with_max_delay(self.backoff_max_delay)
    }
}
