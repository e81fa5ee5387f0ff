//! Sliding-window send counter
//!
//! A [`RateWindow`] keeps the timestamps of events within one horizon
//! (minute, hour or day) and prunes them as they age out.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Rolling count of events over a fixed horizon
#[derive(Debug, Clone)]
pub struct RateWindow {
    horizon: Duration,
    limit: usize,
    timestamps: VecDeque<Instant>,
}

impl RateWindow {
    /// Create a window admitting `limit` events per `horizon`
    pub fn new(horizon: Duration, limit: usize) -> Self {
        Self {
            horizon,
            limit,
            timestamps: VecDeque::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Drop timestamps older than the horizon
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.horizon {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Events within the horizon
    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.timestamps.len()
    }

    /// Whether the limit has been reached
    pub fn is_full(&mut self, now: Instant) -> bool {
        self.count(now) >= self.limit
    }

    /// Events still admitted within the horizon
    pub fn remaining(&mut self, now: Instant) -> usize {
        self.limit.saturating_sub(self.count(now))
    }

    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.timestamps.push_back(now);
    }

    /// Time until one more event is admitted; zero when not full
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        let count = self.count(now);
        if count < self.limit {
            return Duration::ZERO;
        }
        // The window admits again once enough of the oldest timestamps expire
        // to bring the count below the limit.
        match self.timestamps.get(count - self.limit) {
            Some(&ts) => (ts + self.horizon).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Time until the oldest timestamp expires
    pub fn reset_in(&mut self, now: Instant) -> Option<Duration> {
        self.prune(now);
        self.timestamps
            .front()
            .map(|&ts| (ts + self.horizon).saturating_duration_since(now))
    }
}
