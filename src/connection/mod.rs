//! Connection stability
//!
//! [`ConnectionStabilizer`] tracks the transport session and schedules
//! reconnects; [`ActionRateLimiter`] throttles arbitrary actions over a
//! sliding window.

pub mod ratelimit;
pub mod stabilizer;

pub use ratelimit::ActionRateLimiter;
pub use stabilizer::{reconnect_delay, ConnectionStabilizer};

use std::time::Duration;

/// Read-only view of the connection, consumed by the compliance guard and
/// the sync scheduler
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionInfo: Send + Sync {
    /// Whether the transport session is currently open
    fn is_connected(&self) -> bool;

    /// Time since the session opened; `None` while disconnected
    fn uptime(&self) -> Option<Duration>;
}
