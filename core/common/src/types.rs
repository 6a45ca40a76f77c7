//! Common types used throughout Outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a pending action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create an ActionId from an existing string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ActionId cannot be empty".to_string(),
            ));
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

/// Kind of write a pending action represents.
///
/// Informational only: every kind is executed the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(ActionKind::Create),
            "update" => Ok(ActionKind::Update),
            "delete" => Ok(ActionKind::Delete),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown action kind '{}'",
                other
            ))),
        }
    }
}

/// One durable record of a not-yet-confirmed write.
///
/// `target`, `payload` and `method` are opaque cargo; the queue never
/// inspects them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub target: String,
    pub payload: serde_json::Value,
    pub method: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl PendingAction {
    /// Create a new action with a fresh id and no attempts.
    pub fn new(
        kind: ActionKind,
        target: impl Into<String>,
        payload: serde_json::Value,
        method: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: ActionId::generate(),
            kind,
            target: target.into(),
            payload,
            method: method.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
            max_attempts,
        }
    }

    /// Record one failed attempt.
    ///
    /// Returns `true` if the action may be retried on a later drain and
    /// `false` once the ceiling is reached and it must be dropped.
    pub fn record_failure(&mut self) -> bool {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.attempts < self.max_attempts
    }

    /// Whether the attempt ceiling has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
