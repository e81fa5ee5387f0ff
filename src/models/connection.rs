//! Connection-related domain models
//!
//! This module defines the connection lifecycle state, disconnect reasons and
//! the health record maintained by the connection stabilizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall health level, shared by the stabilizer, scheduler and monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally
    #[default]
    Healthy,
    /// Operating with elevated errors or latency
    Degraded,
    /// Not operating
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle state of the transport session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: no further reconnects are scheduled
    Abandoned,
}

/// Why the transport session closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum DisconnectReason {
    /// The account logged out or the session was revoked
    LoggedOut,
    /// The account was banned by the remote side
    Banned,
    /// Another session replaced this one
    Replaced,
    /// Network-level loss
    ConnectionLost,
    /// Remote side closed the stream
    ConnectionClosed,
    /// Keep-alive or handshake timeout
    TimedOut,
    /// The remote side asked for a restart
    RestartRequired,
    /// Session state is corrupt and must be re-established
    BadSession,
    /// Anything else
    Other(String),
}

impl DisconnectReason {
    /// Map a transport status code to a reason
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            403 => DisconnectReason::Banned,
            408 => DisconnectReason::TimedOut,
            428 => DisconnectReason::ConnectionClosed,
            440 => DisconnectReason::Replaced,
            500 => DisconnectReason::BadSession,
            503 => DisconnectReason::ConnectionLost,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Other(format!("status {}", other)),
        }
    }

    /// Terminal reasons abort reconnection
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DisconnectReason::LoggedOut | DisconnectReason::Banned | DisconnectReason::Replaced
        )
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LoggedOut => write!(f, "logged out"),
            DisconnectReason::Banned => write!(f, "banned"),
            DisconnectReason::Replaced => write!(f, "replaced by another session"),
            DisconnectReason::ConnectionLost => write!(f, "connection lost"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::TimedOut => write!(f, "timed out"),
            DisconnectReason::RestartRequired => write!(f, "restart required"),
            DisconnectReason::BadSession => write!(f, "bad session"),
            DisconnectReason::Other(detail) => write!(f, "{}", detail),
        }
    }
}

/// Health record of the transport session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    /// Current health level
    pub status: HealthStatus,

    /// Time of the last health evaluation
    pub last_check: DateTime<Utc>,

    /// Uptime of the current (or last) connection in milliseconds
    pub uptime_ms: u64,

    /// Reconnects performed since the last reset
    pub reconnect_count: u32,

    /// Reason of the last disconnect
    pub last_disconnect_reason: Option<DisconnectReason>,

    /// Last measured round-trip latency in milliseconds
    pub latency_ms: Option<u64>,

    /// Errors per minute over the last 60 seconds
    pub error_rate: f64,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Critical,
            last_check: Utc::now(),
            uptime_ms: 0,
            reconnect_count: 0,
            last_disconnect_reason: None,
            latency_ms: None,
            error_rate: 0.0,
        }
    }
}
