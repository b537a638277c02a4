//! Durable messages for event notifications.
//!
//! Delivery is at-least-once: a message may be handed to more than one
//! consumer when a lease expires, so handlers must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, MessageId, Result};

/// Well-known topics published by the coordination layer itself.
pub mod topics {
    pub const APPROVAL_REQUESTED: &str = "approval-requested";
    pub const APPROVAL_DECIDED: &str = "approval-decided";
    pub const APPROVAL_EXPIRED: &str = "approval-expired";
    pub const JOB_COMPLETED: &str = "job-completed";
    pub const JOB_FAILED: &str = "job-failed";
}

/// Status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::Failed)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "processing" => Ok(MessageStatus::Processing),
            "completed" => Ok(MessageStatus::Completed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown message status: {}",
                other
            ))),
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    pub payload: serde_json::Value,
    /// Higher priorities are consumed first.
    pub priority: i32,
    pub status: MessageStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_claimable(&self, topic: &str, now: DateTime<Utc>) -> bool {
        self.topic == topic
            && self.status == MessageStatus::Pending
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Deserialize the payload into a concrete type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::InvalidInput(format!("message {} payload: {}", self.id, e)))
    }
}

/// Input for publishing a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub topic: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: u32,
}

impl NewMessage {
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::InvalidInput("topic is empty".to_string()));
        }
        Ok(())
    }
}
