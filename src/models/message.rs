//! Outbound message models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery priority of an outbound message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl MessagePriority {
    /// Processing rank; lower is processed first
    pub fn rank(&self) -> u8 {
        match self {
            MessagePriority::Critical => 0,
            MessagePriority::High => 1,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Critical => "critical",
            MessagePriority::High => "high",
            MessagePriority::Normal => "normal",
            MessagePriority::Low => "low",
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message submitted by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipient address understood by the transport
    pub target: String,

    /// Message payload
    pub content: String,

    /// Delivery priority
    #[serde(default)]
    pub priority: MessagePriority,
}

impl OutboundMessage {
    /// Create a normal-priority message
    pub fn new(target: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            content: content.into(),
            priority: MessagePriority::Normal,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Lifecycle status of a tracked message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Queued,
    Sending,
    /// Accepted by the transport, awaiting confirmation
    Sent,
    Delivered,
    Read,
    Failed,
    Cancelled,
}

impl MessageStatus {
    /// Terminal statuses move the message into history
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered
                | MessageStatus::Read
                | MessageStatus::Failed
                | MessageStatus::Cancelled
        )
    }
}

/// Result of one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
}

/// One send attempt of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAttempt {
    /// 1-based attempt number
    pub id: u32,
    pub timestamp: DateTime<Utc>,
    pub status: AttemptStatus,
    pub error: Option<String>,
    /// Failed attempts preceding this one
    pub retry_count: u32,
}

/// A message tracked by the reliability queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliableMessage {
    /// Queue-assigned identifier
    pub id: String,

    pub target: String,

    pub content: String,

    pub priority: MessagePriority,

    /// Attempt budget taken from the priority's policy
    pub max_retries: u32,

    /// Attempts made so far
    pub attempts: Vec<MessageAttempt>,

    pub status: MessageStatus,

    /// Deduplication key over target and content
    pub fingerprint: String,

    /// Identifier assigned by the transport on a successful send
    pub transport_id: Option<String>,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl ReliableMessage {
    /// Number of failed attempts
    pub fn failed_attempts(&self) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Failed)
            .count() as u32
    }

    /// Error of the most recent failed attempt
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.error.as_deref())
    }

    /// Whether `id` names this message, either by queue id or transport id
    pub fn matches_id(&self, id: &str) -> bool {
        self.id == id || self.transport_id.as_deref() == Some(id)
    }
}

/// Delivery state reported by a confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Sent,
    Delivered,
    Read,
}

/// A delivery confirmation, from the transport or synthesized on timeout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfirmation {
    /// Queue id or transport id of the confirmed message
    pub message_id: String,
    pub status: AckStatus,
    pub timestamp: DateTime<Utc>,
    /// True when no explicit ack arrived before the confirmation timeout
    #[serde(default)]
    pub synthesized: bool,
}

impl DeliveryConfirmation {
    /// Explicit confirmation received now
    pub fn new(message_id: impl Into<String>, status: AckStatus) -> Self {
        Self {
            message_id: message_id.into(),
            status,
            timestamp: Utc::now(),
            synthesized: false,
        }
    }
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub sending: usize,
    pub awaiting_confirmation: usize,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_enqueued: u64,
    pub total_attempts: u64,
    pub history_len: usize,
    pub paused: bool,
}
