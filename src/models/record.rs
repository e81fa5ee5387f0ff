//! Records written to the persistence sink

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::connection::ConnectionHealth;
use super::message::{AttemptStatus, MessagePriority};
use super::sync::{SyncKind, SyncOutcome, SyncTrigger};

/// One completed sync run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogRecord {
    pub kind: SyncKind,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    /// Worker outcome on success
    pub outcome: Option<SyncOutcome>,
    pub error: Option<String>,
}

/// One message send attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRecord {
    pub message_id: String,
    pub target: String,
    pub priority: MessagePriority,
    pub attempt: u32,
    pub status: AttemptStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Last-known connection health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub health: ConnectionHealth,
    pub recorded_at: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn new(health: ConnectionHealth) -> Self {
        Self {
            health,
            recorded_at: Utc::now(),
        }
    }
}
