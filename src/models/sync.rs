//! Synchronization models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::connection::HealthStatus;

/// Kind of sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Full,
    Incremental,
}

impl SyncKind {
    /// Queue priority; higher runs first
    pub fn priority(&self) -> u8 {
        match self {
            SyncKind::Full => 2,
            SyncKind::Incremental => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Full => "full",
            SyncKind::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a sync to be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// First sync after a connection opened
    Initial,
    Periodic,
    Manual,
    Retry,
    Recovery,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Initial => "initial",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Manual => "manual",
            SyncTrigger::Retry => "retry",
            SyncTrigger::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sync waiting for a free slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub kind: SyncKind,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub reason: SyncTrigger,
}

impl SyncJob {
    pub fn new(kind: SyncKind, reason: SyncTrigger) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            priority: kind.priority(),
            enqueued_at: Utc::now(),
            reason,
        }
    }
}

/// Result returned by a sync worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Items processed, by category
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,

    /// Non-fatal errors reported by the worker
    #[serde(default)]
    pub errors: Vec<String>,
}

impl SyncOutcome {
    /// Record a processed-item count
    pub fn with_count(mut self, name: impl Into<String>, count: u64) -> Self {
        self.counts.insert(name.into(), count);
        self
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

/// Phase of the scheduler's job state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Scheduled,
    Running,
    RetryScheduled,
    /// Retries exhausted; waits for a new trigger
    Blocked,
}

/// Scheduler status snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub phase: SyncPhase,
    pub is_blocked: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub next_scheduled_sync: Option<DateTime<Utc>>,
    /// Consecutive failures since the last success
    pub failed_attempts: u32,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    /// Exponential moving average of run durations
    pub average_sync_duration_ms: f64,
    pub last_error: Option<String>,
    pub queued_jobs: usize,
}

/// Scheduler health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub status: HealthStatus,
    /// Failures within the failure window
    pub recent_failures: usize,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub average_sync_duration_ms: f64,
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub is_connected: bool,
    pub last_check: DateTime<Utc>,
}
