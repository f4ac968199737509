//! Common types used throughout the outbox queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Error;

/// Unique identifier for a queued action.
///
/// Generated once at enqueue time and never reused. Remote endpoints may
/// treat it as an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidInput("ActionId cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of mutations the queue knows how to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    AddToCart,
    SubmitForm,
    PostComment,
    UpdateProfile,
    LikePost,
    SaveDraft,
    RateProduct,
    BookmarkEvent,
}

impl ActionType {
    /// Every action type, in declaration order.
    pub const ALL: [ActionType; 8] = [
        ActionType::AddToCart,
        ActionType::SubmitForm,
        ActionType::PostComment,
        ActionType::UpdateProfile,
        ActionType::LikePost,
        ActionType::SaveDraft,
        ActionType::RateProduct,
        ActionType::BookmarkEvent,
    ];

    /// Canonical wire name, e.g. `ADD_TO_CART`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::AddToCart => "ADD_TO_CART",
            ActionType::SubmitForm => "SUBMIT_FORM",
            ActionType::PostComment => "POST_COMMENT",
            ActionType::UpdateProfile => "UPDATE_PROFILE",
            ActionType::LikePost => "LIKE_POST",
            ActionType::SaveDraft => "SAVE_DRAFT",
            ActionType::RateProduct => "RATE_PRODUCT",
            ActionType::BookmarkEvent => "BOOKMARK_EVENT",
        }
    }

    /// Lower kebab-case name, e.g. `add-to-cart`. Used in URLs and tags.
    pub fn kebab_name(&self) -> String {
        self.as_str().to_ascii_lowercase().replace('_', "-")
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = Error;

    /// Accepts `ADD_TO_CART` and `add-to-cart`, in any case.
    fn from_str(s: &str) -> crate::Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        ActionType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| Error::UnknownActionType(s.to_string()))
    }
}

/// Dispatch priority band. Higher values are delivered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Numeric value stored alongside the action.
    pub fn value(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 5,
            Priority::High => 10,
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> crate::Result<Self> {
        match value {
            0 => Ok(Priority::Low),
            5 => Ok(Priority::Medium),
            10 => Ok(Priority::High),
            other => Err(Error::InvalidInput(format!("Invalid priority value: {}", other))),
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "0" => Ok(Priority::Low),
            "medium" | "5" => Ok(Priority::Medium),
            "high" | "10" => Ok(Priority::High),
            other => Err(Error::InvalidInput(format!("Invalid priority: {}", other))),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        };
        f.write_str(name)
    }
}

/// A user action waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Unique ID for this action.
    pub id: ActionId,
    /// Which remote endpoint replays the action.
    pub action_type: ActionType,
    /// Data needed to replay the action. Opaque to the queue.
    pub payload: serde_json::Value,
    /// When the action was captured.
    pub enqueued_at: DateTime<Utc>,
    /// Number of failed delivery attempts so far.
    pub retry_count: u32,
    /// Dispatch priority band.
    pub priority: Priority,
}

impl PendingAction {
    /// Capture a new action with a fresh id and zero retries.
    pub fn new(action_type: ActionType, payload: serde_json::Value, priority: Priority) -> Self {
        Self {
            id: ActionId::generate(),
            action_type,
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            priority,
        }
    }

    /// Delivery status as shown to the user.
    pub fn status(&self) -> ActionStatus {
        if self.retry_count == 0 {
            ActionStatus::Queued
        } else {
            ActionStatus::Retrying {
                attempts: self.retry_count,
            }
        }
    }
}

/// Read-only delivery status of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for its first delivery attempt.
    Queued,
    /// At least one attempt failed.
    Retrying { attempts: u32 },
}

/// Why an action left the queue without being delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    /// Every allowed attempt failed.
    RetriesExhausted { last_error: Option<String> },
    /// This build cannot deliver the action's type.
    NoHandler { detail: String },
    /// The stored record could not be read back.
    Unreadable { detail: String },
}

/// An action that was given up on.
///
/// The type is kept by wire name: an unreadable record may carry a type
/// this build does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedAction {
    /// Id the action was queued under.
    pub id: ActionId,
    /// Wire name of the action's type.
    pub action_type: String,
    /// Payload as last stored.
    pub payload: serde_json::Value,
    /// Failed delivery attempts, including the last one.
    pub retry_count: u32,
    /// Why it was dropped.
    pub reason: DropReason,
    /// When it was dropped.
    pub dropped_at: DateTime<Utc>,
}

impl DroppedAction {
    /// Record a drop of `action` happening now.
    pub fn now(action: PendingAction, reason: DropReason) -> Self {
        Self {
            id: action.id,
            action_type: action.action_type.as_str().to_string(),
            payload: action.payload,
            retry_count: action.retry_count,
            reason,
            dropped_at: Utc::now(),
        }
    }
}
