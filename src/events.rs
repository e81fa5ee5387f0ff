//! Typed lifecycle events
//!
//! Each component publishes its events on a `tokio::sync::broadcast` channel.
//! Subscribers that lag behind lose the oldest events, never block the
//! publisher.

use std::time::Duration;

use crate::error::DeliveryError;
use crate::models::{
    DisconnectReason, HealthMetrics, HealthStatus, MessagePriority, SyncKind, SyncOutcome,
    SyncTrigger,
};

/// Capacity of every event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events of the connection stabilizer
#[derive(Debug, Clone, PartialEq)]
pub enum StabilizerEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
        uptime: Duration,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    /// The reconnect delay elapsed; the owner should reconnect now
    ReconnectAttempt {
        attempt: u32,
        max_attempts: u32,
    },
    MaxReconnectAttemptsReached {
        attempts: u32,
    },
    ConnectionAbandoned {
        reason: DisconnectReason,
    },
    HealthChanged {
        previous: HealthStatus,
        current: HealthStatus,
    },
}

/// Events of the message reliability queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        id: String,
        priority: MessagePriority,
    },
    Sent {
        id: String,
        attempt: u32,
    },
    Delivered {
        id: String,
        synthesized: bool,
    },
    Read {
        id: String,
    },
    /// Terminal failure
    Failed {
        id: String,
        error: DeliveryError,
    },
    Cancelled {
        id: String,
    },
    /// An attempt failed and the message stays queued
    RetryScheduled {
        id: String,
        attempt: u32,
        error: String,
    },
    /// The compliance guard deferred processing
    Throttled {
        reason: String,
        wait: Duration,
    },
}

/// Events of the sync scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    ConnectionEstablished,
    ConnectionLost,
    SyncStarted {
        kind: SyncKind,
        trigger: SyncTrigger,
    },
    SyncCompleted {
        kind: SyncKind,
        trigger: SyncTrigger,
        duration: Duration,
        outcome: SyncOutcome,
    },
    SyncFailed {
        kind: SyncKind,
        trigger: SyncTrigger,
        duration: Duration,
        error: String,
        consecutive_failures: u32,
    },
    SyncThrottled {
        kind: SyncKind,
        wait: Duration,
    },
    SyncQueued {
        kind: SyncKind,
        queue_len: usize,
    },
    /// A queued job was removed before it started
    SyncCancelled {
        kind: SyncKind,
        job_id: String,
    },
    RetryScheduled {
        kind: SyncKind,
        attempt: u32,
        delay: Duration,
    },
    SyncRetryExhausted {
        attempts: u32,
    },
    HealthCheck {
        metrics: HealthMetrics,
    },
    HealthCritical {
        recent_failures: usize,
    },
    RecoveryStarted,
    RecoverySucceeded,
    /// Recovery failed; needs external intervention
    SyncSystemFailure {
        error: String,
    },
    Stopped,
}
